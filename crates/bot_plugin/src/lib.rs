pub mod channel;
pub mod codec;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod plugin_process;
pub mod plugin_runtime;
pub mod vocabulary;

pub use channel::{Channel, ChannelState, Reply, Transport};
pub use descriptor::{Arguments, Command, CommandDescriptor, CommandSet, FieldType, Value};
pub use endpoint::{Endpoint, Router};
pub use error::{BridgeError, CallError, ErrorCode, ProtocolError};
pub use plugin_process::{Bot, BridgeOptions, PluginHandle, PluginProcess};
pub use plugin_runtime::{Host, Plugin};
