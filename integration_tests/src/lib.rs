//! Test support for sdolink: a simulated CAN bus, and a scripted SDO server to attach to it
pub mod sdo_server;
pub mod sim_bus;
