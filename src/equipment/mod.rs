//! Lab equipment drivers.
//!
//! Each driver owns one interface, raises faults under its own identity and
//! implements [`Endpoint`](crate::endpoint::Endpoint) itself, so the test flow
//! can connect and disconnect a mixed bench uniformly.

pub mod robot_arm;
pub mod shaker;

pub use robot_arm::{MotionProfile, RobotArm};
pub use shaker::LabShaker;
