pub mod add_server;
pub mod common;
pub mod deploy;
pub mod fingerprint;
pub mod info;
pub mod init;
pub mod release;
pub mod reset;
pub mod servers;
pub mod set;
