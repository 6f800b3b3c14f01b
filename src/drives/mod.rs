// Device inventory, method selection and sanitization backends
//
// - detection.rs: inventory sources (sysfs, static) and capability probing
// - selector.rs: method selection over the closed device classes
// - operations/: backends that run the selected method

pub mod detection;
pub mod operations;
pub mod selector;


pub use detection::{
    CapabilityProbe, CommandProbe, DeviceInventory, InventorySnapshot, InventorySource,
    NullProbe, ProbedCapabilities, StaticInventory, SysfsInventory,
};
pub use operations::{CommandBackend, FaultPlan, SanitizeBackend, SimulatedBackend};
pub use selector::{select, select_with_reason, Selection, SelectionReason};
