pub mod alarm;
pub mod bluetooth;
pub mod logging;
pub mod storage;
pub mod telemetry;
pub mod weather;
