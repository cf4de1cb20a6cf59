//! 传输层基础类型
//!
//! 好友编号、文件槽位、传输 ID、地址等与底层传输共享的值类型。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::transport::error::AddressError;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const NOSPAM_SIZE: usize = 4;
pub const CHECKSUM_SIZE: usize = 2;
/// 地址格式: 公钥 + nospam + 校验和
pub const ADDRESS_SIZE: usize = PUBLIC_KEY_SIZE + NOSPAM_SIZE + CHECKSUM_SIZE;

/// 传输层本地的好友编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// 某个好友下的文件槽位编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileNumber(pub u32);

/// 一次文件传输的唯一标识: (好友, 文件槽位)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId {
    pub peer: PeerId,
    pub file: FileNumber,
}

impl TransferId {
    pub const fn new(peer: PeerId, file: FileNumber) -> Self {
        Self { peer, file }
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/file#{}", self.peer, self.file.0)
    }
}

/// 已发送文本消息的编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

/// 好友地址
///
/// 字节布局: 32 字节公钥 + 4 字节 nospam (大端) + 2 字节校验和。
/// 校验和是前 36 字节按奇偶位置分别异或得到的两个字节。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub public_key: PublicKey,
    pub nospam: u32,
    pub checksum: u16,
}

impl Address {
    pub fn new(public_key: PublicKey, nospam: u32) -> Self {
        Self {
            public_key,
            nospam,
            checksum: Self::checksum_of(&public_key, nospam),
        }
    }

    fn checksum_of(public_key: &PublicKey, nospam: u32) -> u16 {
        let mut sum = [0u8; CHECKSUM_SIZE];
        let nospam = nospam.to_be_bytes();
        for (i, byte) in public_key.0.iter().chain(nospam.iter()).enumerate() {
            sum[i % CHECKSUM_SIZE] ^= byte;
        }
        u16::from_be_bytes(sum)
    }

    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(&self.public_key.0);
        out[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE]
            .copy_from_slice(&self.nospam.to_be_bytes());
        out[PUBLIC_KEY_SIZE + NOSPAM_SIZE..].copy_from_slice(&self.checksum.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() != ADDRESS_SIZE {
            return Err(AddressError::Length {
                expected: ADDRESS_SIZE * 2,
                actual: bytes.len() * 2,
            });
        }

        let mut key = [0u8; PUBLIC_KEY_SIZE];
        key.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        let mut nospam = [0u8; NOSPAM_SIZE];
        nospam.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);
        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&bytes[PUBLIC_KEY_SIZE + NOSPAM_SIZE..]);

        let address = Self::new(PublicKey(key), u32::from_be_bytes(nospam));
        if address.checksum != u16::from_be_bytes(checksum) {
            return Err(AddressError::Checksum);
        }
        Ok(address)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != ADDRESS_SIZE * 2 {
            return Err(AddressError::Length {
                expected: ADDRESS_SIZE * 2,
                actual: s.len(),
            });
        }
        let bytes = hex::decode(s)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.to_bytes()))
    }
}

/// 自身网络连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connection {
    None,
    Tcp,
    Udp,
}

/// 文件传输控制指令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileControl {
    Resume,
    Pause,
    Cancel,
}

impl fmt::Display for FileControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileControl::Resume => "RESUME",
            FileControl::Pause => "PAUSE",
            FileControl::Cancel => "CANCEL",
        };
        f.write_str(name)
    }
}

/// 文件元信息（发送方提供）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// 接收方拉取的数据块请求；长度为 0 表示传输结束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest {
    pub offset: u64,
    pub length: usize,
}

/// 一个数据块；数据为空表示传输结束
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl FileChunk {
    pub fn is_end(&self) -> bool {
        self.data.is_empty()
    }
}
