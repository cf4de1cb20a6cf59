//! 传输层
//!
//! - `native`: 底层好友网络的单线程接口
//! - `bridge`: 泵线程 + 调度线程组成的桥接层
//! - `window`: 拉取请求流控
//! - `memory`: 进程内传输实现

pub mod bridge;
pub mod error;
pub mod memory;
pub mod message;
pub mod native;
pub mod types;
pub mod window;

pub use bridge::{Bridge, BridgeConfig, BridgeHandle, FileEvents, FriendEvents};
pub use error::{AddressError, HandlerKind, TransportError};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{InboundEvent, Pending};
pub use native::{NativeError, NativeEvent, Transport};
pub use types::{
    Address, ChunkRequest, Connection, FileChunk, FileControl, FileInfo, FileNumber, MessageId,
    PeerId, PublicKey, TransferId,
};
pub use window::{FlowWindow, WindowConfig, WindowTable};
