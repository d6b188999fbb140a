//! SNMP wire stack: BER codec, message framing, USM security, the agent
//! itself and the trap emitter.

pub mod agent;
pub mod ber;
pub mod error;
pub mod message;
pub mod oid;
pub mod pdu;
pub mod trap;
pub mod usm;
pub mod value;

pub use agent::{Agent, AgentConfig, Binding, BindingSet, CommunityRole, Engine, ValueStore};
pub use error::{ErrorStatus, SnmpError, SnmpResult};
pub use message::Version;
pub use oid::Oid;
pub use trap::{TrapDestination, TrapEvent, TrapSender};
pub use usm::{AuthProtocol, PrivProtocol, UsmUser};
pub use value::{Value, VarBind};
