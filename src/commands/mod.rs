pub mod cancel;
pub mod capacity;
pub mod kill;
pub mod notify_origin;
pub mod offload;
pub mod peers;
pub mod pending;
pub mod queue;
pub mod rename;
pub mod serve;
pub mod status;
