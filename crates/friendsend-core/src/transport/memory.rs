//! 进程内传输
//!
//! 在同一进程内模拟任意多个节点之间的好友网络和拉取式文件协议，
//! 供集成测试和守护进程的回环模式使用。
//!
//! 协议行为:
//!
//! - 发送方提供文件后，接收方收到 `FileOffered`
//! - 接收方发送 `Resume` 后，发送方开始收到按 [`CHUNK_SIZE`] 切分的拉取请求，
//!   同时最多 [`MAX_OUTSTANDING`] 个未完成
//! - 发送方发出的每个数据块以 `ChunkReceived` 交给接收方
//! - 全部字节送达后，发送方收到长度为 0 的拉取请求，接收方收到空数据块
//! - 暂停、恢复、取消都会转发给另一方
//!
//! 文件编号由全网共享的计数器分配，因此两侧看到的 `FileNumber` 相同；
//! `PeerId` 是对方在本节点好友列表中的下标。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::transport::native::{NativeError, NativeEvent, Transport};
use crate::transport::types::{
    self, Address, ChunkRequest, Connection, FileChunk, FileControl, FileInfo, FileNumber,
    MessageId, PeerId, PublicKey, TransferId,
};

/// 单个拉取请求的最大长度
pub const CHUNK_SIZE: usize = 1371;
/// 每个传输同时未完成的拉取请求上限
pub const MAX_OUTSTANDING: usize = 32;

pub const ERR_FRIEND_NOT_FOUND: i32 = 1;
pub const ERR_FILE_NOT_FOUND: i32 = 2;
pub const ERR_INVALID_LENGTH: i32 = 3;
pub const ERR_UNKNOWN_KEY: i32 = 4;
pub const ERR_ALREADY_FRIEND: i32 = 5;
pub const ERR_EMPTY_MESSAGE: i32 = 6;
pub const ERR_BAD_STATE: i32 = 7;

struct Node {
    name: String,
    nospam: u32,
    friends: Vec<PublicKey>,
    inbox: VecDeque<NativeEvent>,
    next_message: u32,
}

impl Node {
    fn new(name: &str, nospam: u32, friends: Vec<PublicKey>) -> Self {
        Self {
            name: name.to_string(),
            nospam,
            friends,
            inbox: VecDeque::new(),
            next_message: 0,
        }
    }

    fn peer_of(&self, key: &PublicKey) -> Option<PeerId> {
        self.friends
            .iter()
            .position(|k| k == key)
            .map(|i| PeerId(i as u32))
    }

    fn friend(&self, peer: PeerId) -> Result<PublicKey, NativeError> {
        self.friends.get(peer.0 as usize).copied().ok_or_else(|| {
            NativeError::new(ERR_FRIEND_NOT_FOUND, format!("friend {} not found", peer))
        })
    }
}

/// 一个进行中的文件传输（全网视角）
struct Flow {
    sender: PublicKey,
    receiver: PublicKey,
    size: u64,
    accepted: bool,
    paused: bool,
    /// 下一个拉取请求的偏移
    requested: u64,
    /// 接收方已收到的最高偏移
    delivered: u64,
    outstanding: usize,
}

impl Flow {
    fn counterpart(&self, key: &PublicKey) -> Option<PublicKey> {
        if *key == self.sender {
            Some(self.receiver)
        } else if *key == self.receiver {
            Some(self.sender)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Hub {
    nodes: HashMap<PublicKey, Node>,
    flows: HashMap<u32, Flow>,
    next_file: u32,
}

impl Hub {
    fn node(&self, key: &PublicKey) -> Result<&Node, NativeError> {
        self.nodes
            .get(key)
            .ok_or_else(|| NativeError::new(ERR_UNKNOWN_KEY, format!("unknown key {}", key)))
    }

    fn node_mut(&mut self, key: &PublicKey) -> Result<&mut Node, NativeError> {
        self.nodes
            .get_mut(key)
            .ok_or_else(|| NativeError::new(ERR_UNKNOWN_KEY, format!("unknown key {}", key)))
    }

    /// 以 `to` 的视角投递事件；`from` 必须在 `to` 的好友列表中
    fn post(&mut self, to: &PublicKey, from: &PublicKey, make: impl FnOnce(PeerId) -> NativeEvent) {
        if let Some(node) = self.nodes.get_mut(to) {
            if let Some(peer) = node.peer_of(from) {
                node.inbox.push_back(make(peer));
            }
        }
    }

    /// 把 `b` 加入 `a` 的好友列表并通知双方
    fn link(&mut self, a: &PublicKey, b: &PublicKey) -> Result<PeerId, NativeError> {
        let node = self.node_mut(a)?;
        if node.peer_of(b).is_some() {
            return Err(NativeError::new(ERR_ALREADY_FRIEND, format!("{} is already a friend", b)));
        }
        node.friends.push(*b);
        let peer = PeerId(node.friends.len() as u32 - 1);

        if let Some(other) = self.nodes.get_mut(b) {
            if other.peer_of(a).is_none() {
                other.friends.push(*a);
            }
        }
        self.announce(a, b);
        Ok(peer)
    }

    /// 双方都在线且互为好友时，交换名字
    fn announce(&mut self, a: &PublicKey, b: &PublicKey) {
        let (Some(a_name), Some(b_name)) = (
            self.nodes.get(a).map(|n| n.name.clone()),
            self.nodes.get(b).map(|n| n.name.clone()),
        ) else {
            return;
        };
        self.post(a, b, |peer| NativeEvent::FriendName { peer, name: b_name });
        self.post(b, a, |peer| NativeEvent::FriendName { peer, name: a_name });
    }

    fn flow_of(&mut self, me: &PublicKey, id: TransferId) -> Result<&mut Flow, NativeError> {
        let friend = self.node(me)?.friend(id.peer)?;
        match self.flows.get_mut(&id.file.0) {
            Some(flow) if flow.counterpart(me) == Some(friend) => Ok(flow),
            _ => Err(NativeError::new(ERR_FILE_NOT_FOUND, format!("transfer {} not found", id))),
        }
    }

    /// 全部字节送达: 通知双方结束并移除
    fn complete(&mut self, file: u32) {
        let Some(flow) = self.flows.remove(&file) else {
            return;
        };
        debug!("Memory transfer file#{} complete ({} bytes)", file, flow.size);
        let file = FileNumber(file);
        let offset = flow.size;
        self.post(&flow.sender, &flow.receiver, |peer| NativeEvent::ChunkRequested {
            id: TransferId::new(peer, file),
            request: ChunkRequest { offset, length: 0 },
        });
        self.post(&flow.receiver, &flow.sender, |peer| NativeEvent::ChunkReceived {
            id: TransferId::new(peer, file),
            chunk: FileChunk {
                offset,
                data: Vec::new(),
            },
        });
    }

    /// 为 `me` 作为发送方的活动传输生成拉取请求
    fn generate_pulls(&mut self, me: &PublicKey) -> Vec<NativeEvent> {
        let Some(node) = self.nodes.get(me) else {
            return Vec::new();
        };
        let mut pulls = Vec::new();
        for (&file, flow) in self.flows.iter_mut() {
            if flow.sender != *me || !flow.accepted || flow.paused {
                continue;
            }
            let Some(peer) = node.peer_of(&flow.receiver) else {
                continue;
            };
            while flow.outstanding < MAX_OUTSTANDING && flow.requested < flow.size {
                let length = (flow.size - flow.requested).min(CHUNK_SIZE as u64) as usize;
                pulls.push(NativeEvent::ChunkRequested {
                    id: TransferId::new(peer, FileNumber(file)),
                    request: ChunkRequest {
                        offset: flow.requested,
                        length,
                    },
                });
                flow.requested += length as u64;
                flow.outstanding += 1;
            }
        }
        pulls
    }
}

/// 保存到磁盘的节点状态
#[derive(Debug, Serialize, Deserialize)]
struct SavedNode {
    public_key: PublicKey,
    nospam: u32,
    name: String,
    friends: Vec<PublicKey>,
}

/// 进程内的好友网络
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
    interval: Duration,
}

impl MemoryNetwork {
    /// `interval` 是各节点事件泵的迭代间隔
    pub fn new(interval: Duration) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            interval,
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 用新生成的身份创建一个节点
    pub fn node(&self, name: &str) -> MemoryTransport {
        let mut rng = rand::thread_rng();
        let mut hub = self.hub();
        let key = loop {
            let mut key = [0u8; types::PUBLIC_KEY_SIZE];
            rng.fill_bytes(&mut key);
            let key = PublicKey(key);
            if !hub.nodes.contains_key(&key) {
                break key;
            }
        };
        hub.nodes
            .insert(key, Node::new(name, rng.next_u32(), Vec::new()));
        debug!("Memory node '{}' created with key {}", name, key);
        self.transport(key)
    }

    /// 从 [`Transport::save_state`] 导出的状态恢复节点
    pub fn restore(&self, name: &str, state: &[u8]) -> Result<MemoryTransport, NativeError> {
        let saved: SavedNode = serde_json::from_slice(state)
            .map_err(|e| NativeError::new(ERR_BAD_STATE, format!("invalid saved state: {}", e)))?;

        let mut hub = self.hub();
        if hub.nodes.contains_key(&saved.public_key) {
            return Err(NativeError::new(
                ERR_BAD_STATE,
                format!("key {} is already online", saved.public_key),
            ));
        }
        let key = saved.public_key;
        let friends = saved.friends.clone();
        hub.nodes
            .insert(key, Node::new(name, saved.nospam, saved.friends));
        for friend in &friends {
            let mutual = hub
                .nodes
                .get(friend)
                .is_some_and(|n| n.peer_of(&key).is_some());
            if mutual {
                hub.announce(&key, friend);
            }
        }
        info!(
            "Memory node '{}' restored with {} friends",
            name,
            friends.len()
        );
        drop(hub);
        Ok(self.transport(key))
    }

    fn transport(&self, key: PublicKey) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            key,
        }
    }

    /// 从 `from` 向 `to` 发送好友请求
    pub fn request_friend(
        &self,
        from: &PublicKey,
        to: &Address,
        message: &str,
    ) -> Result<(), NativeError> {
        if message.is_empty() {
            return Err(NativeError::new(ERR_EMPTY_MESSAGE, "friend request message is empty"));
        }
        let mut hub = self.hub();
        hub.node(from)?;
        let target = hub.node_mut(&to.public_key)?;
        if target.nospam != to.nospam {
            return Err(NativeError::new(ERR_UNKNOWN_KEY, "nospam mismatch"));
        }
        if target.peer_of(from).is_some() {
            return Err(NativeError::new(ERR_ALREADY_FRIEND, format!("{} is already a friend", from)));
        }
        target.inbox.push_back(NativeEvent::FriendRequest {
            key: *from,
            message: message.to_string(),
        });
        Ok(())
    }

    /// 直接让两个节点互为好友
    pub fn befriend(&self, a: &PublicKey, b: &PublicKey) -> Result<(), NativeError> {
        let mut hub = self.hub();
        hub.node(b)?;
        hub.link(a, b).map(|_| ())
    }

    /// 当前进行中的传输数
    pub fn active_transfers(&self) -> usize {
        self.hub().flows.len()
    }
}

/// 进程内网络中的一个节点
///
/// 丢弃时节点下线，与其相关的传输被取消。
pub struct MemoryTransport {
    network: MemoryNetwork,
    key: PublicKey,
}

impl MemoryTransport {
    pub fn public_key(&self) -> PublicKey {
        self.key
    }

    pub fn address(&self) -> Address {
        let nospam = self.network.hub().nodes.get(&self.key).map_or(0, |n| n.nospam);
        Address::new(self.key, nospam)
    }
}

impl Transport for MemoryTransport {
    const PUBLIC_KEY_SIZE: usize = types::PUBLIC_KEY_SIZE;
    const ADDRESS_SIZE: usize = types::ADDRESS_SIZE;

    fn iteration_interval(&self) -> Duration {
        self.network.interval
    }

    fn pump_once(&mut self, sink: &mut dyn FnMut(NativeEvent)) {
        let events: Vec<NativeEvent> = {
            let mut hub = self.network.hub();
            let mut events: Vec<NativeEvent> = match hub.nodes.get_mut(&self.key) {
                Some(node) => node.inbox.drain(..).collect(),
                None => return,
            };
            events.extend(hub.generate_pulls(&self.key));
            events
        };
        for event in events {
            sink(event);
        }
    }

    fn self_address(&self) -> Address {
        self.address()
    }

    fn connection_status(&self) -> Connection {
        Connection::Udp
    }

    fn add_friend_norequest(&mut self, key: &PublicKey) -> Result<PeerId, NativeError> {
        if *key == self.key {
            return Err(NativeError::new(ERR_UNKNOWN_KEY, "cannot befriend self"));
        }
        self.network.hub().link(&self.key, key)
    }

    fn friend_public_key(&self, peer: PeerId) -> Result<PublicKey, NativeError> {
        self.network.hub().node(&self.key)?.friend(peer)
    }

    fn send_text(&mut self, peer: PeerId, text: &str) -> Result<MessageId, NativeError> {
        if text.is_empty() {
            return Err(NativeError::new(ERR_EMPTY_MESSAGE, "message is empty"));
        }
        let mut hub = self.network.hub();
        let node = hub.node_mut(&self.key)?;
        let friend = node.friend(peer)?;
        let id = MessageId(node.next_message);
        node.next_message = node.next_message.wrapping_add(1);

        let text = text.to_string();
        hub.post(&friend, &self.key, |peer| NativeEvent::FriendMessage { peer, text });
        Ok(id)
    }

    fn offer_file(&mut self, peer: PeerId, name: &str, size: u64) -> Result<TransferId, NativeError> {
        let mut hub = self.network.hub();
        let friend = hub.node(&self.key)?.friend(peer)?;
        let online = hub
            .nodes
            .get(&friend)
            .is_some_and(|n| n.peer_of(&self.key).is_some());
        if !online {
            return Err(NativeError::new(
                ERR_FRIEND_NOT_FOUND,
                format!("friend {} is not connected", peer),
            ));
        }

        let file = hub.next_file;
        hub.next_file = hub.next_file.wrapping_add(1);
        hub.flows.insert(
            file,
            Flow {
                sender: self.key,
                receiver: friend,
                size,
                accepted: false,
                paused: false,
                requested: 0,
                delivered: 0,
                outstanding: 0,
            },
        );
        let info = FileInfo {
            name: name.to_string(),
            size,
        };
        hub.post(&friend, &self.key, |peer| NativeEvent::FileOffered {
            id: TransferId::new(peer, FileNumber(file)),
            info,
        });
        Ok(TransferId::new(peer, FileNumber(file)))
    }

    fn set_file_control(&mut self, id: TransferId, control: FileControl) -> Result<(), NativeError> {
        let mut hub = self.network.hub();
        let me = self.key;
        let flow = hub.flow_of(&me, id)?;
        let other = if flow.sender == me { flow.receiver } else { flow.sender };

        let mut finished = false;
        match control {
            FileControl::Resume => {
                if flow.receiver == me {
                    flow.accepted = true;
                }
                flow.paused = false;
                // 重新拉取未送达的部分
                flow.requested = flow.delivered;
                flow.outstanding = 0;
                finished = flow.accepted && flow.size == 0;
            }
            FileControl::Pause => flow.paused = true,
            FileControl::Cancel => {
                hub.flows.remove(&id.file.0);
            }
        }

        hub.post(&other, &me, |peer| NativeEvent::FileControl {
            id: TransferId::new(peer, id.file),
            control,
        });
        if finished {
            hub.complete(id.file.0);
        }
        Ok(())
    }

    fn send_chunk(&mut self, id: TransferId, offset: u64, data: &[u8]) -> Result<(), NativeError> {
        let mut hub = self.network.hub();
        let me = self.key;
        let flow = hub.flow_of(&me, id)?;
        if flow.sender != me {
            return Err(NativeError::new(
                ERR_FILE_NOT_FOUND,
                format!("transfer {} is not outbound", id),
            ));
        }
        let end = offset + data.len() as u64;
        if data.is_empty() || end > flow.size {
            return Err(NativeError::new(
                ERR_INVALID_LENGTH,
                format!("chunk {}+{} out of range", offset, data.len()),
            ));
        }

        flow.outstanding = flow.outstanding.saturating_sub(1);
        flow.delivered = flow.delivered.max(end);
        let receiver = flow.receiver;
        let finished = flow.delivered >= flow.size;

        let chunk = FileChunk {
            offset,
            data: data.to_vec(),
        };
        hub.post(&receiver, &me, |peer| NativeEvent::ChunkReceived {
            id: TransferId::new(peer, id.file),
            chunk,
        });
        if finished {
            hub.complete(id.file.0);
        }
        Ok(())
    }

    fn save_state(&self) -> Result<Vec<u8>, NativeError> {
        let hub = self.network.hub();
        let node = hub.node(&self.key)?;
        let saved = SavedNode {
            public_key: self.key,
            nospam: node.nospam,
            name: node.name.clone(),
            friends: node.friends.clone(),
        };
        serde_json::to_vec_pretty(&saved)
            .map_err(|e| NativeError::new(ERR_BAD_STATE, format!("failed to encode state: {}", e)))
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut hub = self.network.hub();
        if hub.nodes.remove(&self.key).is_none() {
            return;
        }
        let me = self.key;
        let gone: Vec<(u32, PublicKey)> = hub
            .flows
            .iter()
            .filter_map(|(&file, flow)| flow.counterpart(&me).map(|other| (file, other)))
            .collect();
        for (file, other) in gone {
            hub.flows.remove(&file);
            hub.post(&other, &me, |peer| NativeEvent::FileControl {
                id: TransferId::new(peer, FileNumber(file)),
                control: FileControl::Cancel,
            });
        }
        debug!("Memory node {} went offline", me);
    }
}
