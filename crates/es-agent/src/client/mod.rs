//! Plain request/response path to the control server

mod http;

pub use http::{ControlPlaneClient, REQUEST_TIMEOUT};
