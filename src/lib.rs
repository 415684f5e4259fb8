// Module naming follows project convention (Core = substrate + allocation, Deep = deep-copy messages)
#[allow(non_snake_case)]
pub mod Core;
#[allow(non_snake_case)]
pub mod Deep;
#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}
pub mod error;
pub mod ffi;

pub use Core::{Endpoint, LocalFabric, Substrate};
pub use Deep::Manifest::{CountField, ElementLayout, RecordLayout, TransportDescriptor};
pub use Deep::{LengthMode, Message, MessageBuilder, MessageState, RootId};
pub use error::{DeepCopyError, DeepResult, SubstrateError, SubstrateResult};
