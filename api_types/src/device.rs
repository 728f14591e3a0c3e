pub mod interface;

pub use interface::DeviceInterface;
