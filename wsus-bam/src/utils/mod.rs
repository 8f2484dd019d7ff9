pub mod fs;
pub mod hash;
pub mod http_client;
pub mod retry;
