//! Game simulation modules

pub mod combat;
pub mod directory;
pub mod geometry;
pub mod maze;
pub mod physics;
pub mod session;
pub mod snapshot;

pub use directory::{DirectoryError, SessionDirectory};
pub use session::{BoundedIntent, FireRequest, SessionError, SessionHandle, VehicleIntent};
