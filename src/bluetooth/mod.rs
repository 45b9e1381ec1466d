pub mod address;
pub mod bluez;
pub mod bridge;
pub mod media;
pub mod policy;
