pub mod debugger;
pub mod log;
pub mod scenario;
pub mod version;
