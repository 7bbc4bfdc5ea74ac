/*!
# bmc-devkit - test doubles for bmc-agent

Lets the agent's loops be exercised without BMCs, broker or inventory:
- Spy out-of-band sessions recording every call, with programmable failures
- Fake inventory service recording submitted batches
- Scripted command sources replaying stream outcomes
- Lease file fixtures in both store formats
*/

pub mod command_stub;
pub mod fixtures;
pub mod inventory_stub;
pub mod oob_stub;
pub mod test_utils;

pub use command_stub::{ScriptedSource, Subscription};
pub use fixtures::{isc_leases, kea_leases, IscLeaseBuilder, LeaseFile};
pub use inventory_stub::FakeInventory;
pub use oob_stub::{Call, FakeConnector, MachineProfile, SpySession};
pub use test_utils::{init_tracing, wait_until, within};
