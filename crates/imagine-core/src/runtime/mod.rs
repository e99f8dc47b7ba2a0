pub mod admission;
pub mod orchestrator;
pub mod storage;
pub mod worker;
