//! Six-joint robot arm (Universal Robots UR5) driven with URScript `movej`
//! commands over its secondary client port.
//!
//! Positions are given in degrees per joint and sent in radians. The arm is
//! returned to its upright home position after connecting and before
//! disconnecting, and every move waits a fixed settling time because the
//! controller does not report completion on this port.

use crate::endpoint::{ConnectionState, Endpoint};
use crate::error::{FaultOrigin, FaultResult};
use crate::interface::socket::SocketInterface;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Span};

/// URScript secondary client port.
pub const DEFAULT_PORT: u16 = 30002;

/// Number of joints.
pub const JOINTS: usize = 6;

/// Upright home position in degrees.
pub const HOME_POSITION: [f64; JOINTS] = [0.0, -90.0, 0.0, -90.0, 0.0, 0.0];

/// Default wait after each move.
pub const DEFAULT_SETTLING_TIME: Duration = Duration::from_secs(5);

/// Motion parameters of the leading axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionProfile {
    /// Joint acceleration, rad/s²
    pub acceleration: f64,
    /// Joint speed, rad/s
    pub speed: f64,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            acceleration: 1.0,
            speed: 0.5,
        }
    }
}

/// Build the `movej` line for a position given in degrees.
pub fn movej_command(degrees: &[f64], profile: MotionProfile) -> String {
    let radians: Vec<String> = degrees.iter().map(|d| format!("{:?}", d.to_radians())).collect();
    format!(
        "movej([{}], a={:?}, v={:?})\n",
        radians.join(", "),
        profile.acceleration,
        profile.speed
    )
}

/// Robot arm driver over any byte endpoint (a [`SocketInterface`] in production).
pub struct RobotArm<E: Endpoint = SocketInterface> {
    interface: E,
    profile: MotionProfile,
    settling_time: Duration,
    origin: FaultOrigin,
    span: Span,
}

impl RobotArm<SocketInterface> {
    /// Arm controller at `host` on the default port.
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_interface(SocketInterface::new(host, DEFAULT_PORT))
    }
}

impl<E: Endpoint> RobotArm<E> {
    /// Arm driven through `interface`.
    pub fn with_interface(interface: E) -> Self {
        Self {
            interface,
            profile: MotionProfile::default(),
            settling_time: DEFAULT_SETTLING_TIME,
            origin: FaultOrigin::new("UR5"),
            span: info_span!("robot_arm"),
        }
    }

    /// Wait after each move.
    pub fn with_settling_time(mut self, settling_time: Duration) -> Self {
        self.settling_time = settling_time;
        self
    }

    /// Acceleration and speed used for moves.
    pub fn with_profile(mut self, profile: MotionProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Replace the tracing span this driver logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The owned interface.
    pub fn interface(&self) -> &E {
        &self.interface
    }

    /// Move all six joints to `degrees` and wait for the arm to settle.
    ///
    /// The vector is validated before anything is sent.
    pub async fn set_position_raw(&mut self, degrees: &[f64]) -> FaultResult<()> {
        if degrees.len() != JOINTS {
            return Err(self.origin.parameter(format!(
                "wrong length of position vector: {}, should be {}",
                degrees.len(),
                JOINTS
            )));
        }
        if let Some(bad) = degrees.iter().find(|d| !d.is_finite()) {
            return Err(self.origin.parameter(format!("non-finite joint angle: {}", bad)));
        }

        let command = movej_command(degrees, self.profile);
        debug!(parent: &self.span, command = command.trim_end(), "move");
        self.interface
            .write(command.as_bytes())
            .await
            .map_err(|f| self.origin.adopt(f))?;
        tokio::time::sleep(self.settling_time).await;
        Ok(())
    }

    /// Return to [`HOME_POSITION`].
    pub async fn restore_to_default_position(&mut self) -> FaultResult<()> {
        self.set_position_raw(&HOME_POSITION).await
    }
}

#[async_trait]
impl<E: Endpoint> Endpoint for RobotArm<E> {
    fn identity(&self) -> &str {
        self.origin.identity()
    }

    fn state(&self) -> ConnectionState {
        self.interface.state()
    }

    async fn bind(&mut self) -> FaultResult<()> {
        info!(parent: &self.span, "connecting");
        if let Err(fault) = self.interface.connect().await {
            return Err(self.origin.could_not_connect("Error connecting to the arm controller", &fault));
        }
        if let Err(fault) = self.restore_to_default_position().await {
            self.interface.disconnect().await;
            return Err(fault);
        }
        Ok(())
    }

    async fn release(&mut self) {
        info!(parent: &self.span, "disconnecting");
        if let Err(fault) = self.restore_to_default_position().await {
            warn!(parent: &self.span, %fault, "could not park arm");
        }
        self.interface.disconnect().await;
    }
}
