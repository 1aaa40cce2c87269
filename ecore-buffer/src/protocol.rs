//! Queue wire protocol
//!
//! Messages are JSON objects tagged by `type`. File descriptors never go
//! into the JSON body: they travel next to it in the [`Frame`] and the body
//! refers to them by position, the way SCM_RIGHTS ancillary data rides along
//! a socket write.

use crate::backend::Export;
use crate::format::Format;
use crate::queue::BufferSerial;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::os::fd::OwnedFd;

/// How an attached buffer can be reached on the receiving side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WireExport {
    Id { id: u32 },
    /// Index into the frame's descriptor list
    Fd { index: usize },
}

/// Every message exchanged between a provider and a consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Sent to the provider when a consumer is attached to the queue
    ConsumerConnected {
        queue_size: u32,
        width: u32,
        height: u32,
    },
    ConsumerDisconnected,
    /// Sent to the consumer when a provider is attached to the queue
    ProviderConnected,
    ProviderDisconnected,
    /// A buffer the consumer has not seen yet
    BufferAttached {
        serial: BufferSerial,
        backend: String,
        width: u32,
        height: u32,
        format: Format,
        flags: u32,
        export: WireExport,
    },
    /// Provider dropped a buffer that is not in the consumer's hands
    BufferDetached { serial: BufferSerial },
    BufferEnqueued { serial: BufferSerial },
    BufferReleased { serial: BufferSerial },
    /// Consumer changed its preferred buffer size
    BufferSize { width: u32, height: u32 },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::ConsumerConnected { .. } => "consumer_connected",
            Message::ConsumerDisconnected => "consumer_disconnected",
            Message::ProviderConnected => "provider_connected",
            Message::ProviderDisconnected => "provider_disconnected",
            Message::BufferAttached { .. } => "buffer_attached",
            Message::BufferDetached { .. } => "buffer_detached",
            Message::BufferEnqueued { .. } => "buffer_enqueued",
            Message::BufferReleased { .. } => "buffer_released",
            Message::BufferSize { .. } => "buffer_size",
        }
    }
}

/// Encoded message plus out-of-band descriptors
#[derive(Debug)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl Frame {
    pub fn encode(message: &Message, fds: Vec<OwnedFd>) -> Result<Frame> {
        let bytes = serde_json::to_vec(message)?;
        Ok(Frame { bytes, fds })
    }

    pub fn decode(self) -> Result<(Message, Vec<OwnedFd>)> {
        let message: Message = serde_json::from_slice(&self.bytes)?;
        if let Message::BufferAttached {
            export: WireExport::Fd { index },
            ..
        } = &message
        {
            if *index >= self.fds.len() {
                return Err(Error::Protocol(format!(
                    "descriptor {} missing from frame ({} attached)",
                    index,
                    self.fds.len()
                )));
            }
        }
        Ok((message, self.fds))
    }
}

impl WireExport {
    /// Split an export into its wire form, moving any descriptor into `fds`
    pub fn pack(export: Export, fds: &mut Vec<OwnedFd>) -> WireExport {
        match export {
            Export::Id(id) => WireExport::Id { id },
            Export::Fd(fd) => {
                fds.push(fd);
                WireExport::Fd {
                    index: fds.len() - 1,
                }
            }
        }
    }

    /// Rebuild the export, taking the referenced descriptor out of `fds`
    pub fn unpack(self, fds: &mut [Option<OwnedFd>]) -> Result<Export> {
        match self {
            WireExport::Id { id } => Ok(Export::Id(id)),
            WireExport::Fd { index } => fds
                .get_mut(index)
                .and_then(Option::take)
                .map(Export::Fd)
                .ok_or_else(|| Error::Protocol(format!("descriptor {} already consumed", index))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_message_json_shape() {
        let msg = Message::BufferEnqueued {
            serial: BufferSerial(3),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"buffer_enqueued","serial":3}"#);

        let attached = Message::BufferAttached {
            serial: BufferSerial(1),
            backend: "shm".into(),
            width: 64,
            height: 32,
            format: Format::Argb8888,
            flags: 0,
            export: WireExport::Fd { index: 0 },
        };
        let value: serde_json::Value = serde_json::to_value(&attached).unwrap();
        assert_eq!(value["format"], "AR24");
        assert_eq!(value["export"]["kind"], "fd");
    }

    #[test]
    fn test_frame_carries_descriptor() {
        let fd: OwnedFd = File::open("/dev/null").unwrap().into();
        let mut fds = Vec::new();
        let export = WireExport::pack(Export::Fd(fd), &mut fds);
        let msg = Message::BufferAttached {
            serial: BufferSerial(9),
            backend: "dri3".into(),
            width: 8,
            height: 8,
            format: Format::Xrgb8888,
            flags: 0,
            export,
        };

        let frame = Frame::encode(&msg, fds).unwrap();
        let (decoded, fds) = frame.decode().unwrap();
        assert_eq!(decoded, msg);

        let mut slots: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();
        assert!(matches!(export.unpack(&mut slots), Ok(Export::Fd(_))));
        assert!(export.unpack(&mut slots).is_err());
    }

    #[test]
    fn test_missing_descriptor_rejected() {
        let msg = Message::BufferAttached {
            serial: BufferSerial(1),
            backend: "shm".into(),
            width: 8,
            height: 8,
            format: Format::Xrgb8888,
            flags: 0,
            export: WireExport::Fd { index: 0 },
        };
        let frame = Frame::encode(&msg, Vec::new()).unwrap();
        assert!(matches!(frame.decode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_garbage_rejected() {
        let frame = Frame {
            bytes: b"{\"type\":\"nope\"}".to_vec(),
            fds: Vec::new(),
        };
        assert!(matches!(frame.decode(), Err(Error::Codec(_))));
    }
}
