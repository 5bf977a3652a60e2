//! # Control Handler
//!
//! Executes decoded key-daemon requests against a registry. This is the one
//! place where [`SaError`] values turn into wire `errno` codes.

use alloc::vec;
use alloc::vec::Vec;

use crate::directory::ConsumerId;
use crate::error::{SaError, SaResult};
use crate::lifecycle::DeleteOutcome;
use crate::message::{KeyMessage, MessageType};
use crate::registry::SaRegistry;
use crate::sa::{SaState, SaType};

/// Request dispatcher bound to one registry
#[derive(Debug, Clone, Copy)]
pub struct ControlHandler<'a> {
    registry: &'a SaRegistry,
}

impl<'a> ControlHandler<'a> {
    /// Create a handler for `registry`
    pub fn new(registry: &'a SaRegistry) -> Self {
        Self { registry }
    }

    /// Execute one request and return the replies for its sender
    pub fn handle(&self, consumer: ConsumerId, request: &KeyMessage) -> Vec<KeyMessage> {
        match self.dispatch(consumer, request) {
            Ok(replies) => replies,
            Err(err) => {
                log::debug!(
                    "ipsec: {:?} from {} failed: {}",
                    request.msg_type,
                    consumer,
                    err
                );
                vec![request.reply(err.errno())]
            },
        }
    }

    /// Decode, execute and encode
    ///
    /// Undecodable input is returned to the caller, which owns the channel
    /// and decides how to reject it.
    pub fn handle_bytes(&self, consumer: ConsumerId, request: &[u8]) -> SaResult<Vec<Vec<u8>>> {
        let request = KeyMessage::decode(request)?;
        self.handle(consumer, &request)
            .iter()
            .map(KeyMessage::encode)
            .collect()
    }

    fn dispatch(&self, consumer: ConsumerId, request: &KeyMessage) -> SaResult<Vec<KeyMessage>> {
        let reg = self.registry;

        match request.msg_type {
            MessageType::Add => {
                reg.add(request.to_record()?)?;
                Ok(vec![Self::ok(request, SaState::Complete)])
            },
            MessageType::Update => {
                reg.update(request.to_record()?)?;
                Ok(vec![Self::ok(request, SaState::Complete)])
            },
            MessageType::Delete => match reg.delete(&request.sa_key()?)? {
                DeleteOutcome::Absent => Err(SaError::NotFound),
                _ => Ok(vec![request.reply(0)]),
            },
            MessageType::Get => {
                let sa = reg.get(&request.sa_key()?)?;
                let mut reply = KeyMessage::from_record(MessageType::Get, &sa);
                reply.pid = request.pid;
                reply.seq = request.seq;
                Ok(vec![reply])
            },
            MessageType::GetSpi => {
                let (src, dst) = request.endpoints()?;
                let range = match (request.lifetime_1, request.lifetime_2) {
                    (0, 0) => None,
                    (low, high) => Some((low, high)),
                };
                let spi = reg.get_spi(request.sa_type()?, request.assoc_version, src, dst, range)?;

                let mut reply = Self::ok(request, SaState::Provisional);
                reply.spi = spi;
                Ok(vec![reply])
            },
            MessageType::Register => {
                reg.register(consumer, request.sa_type()?)?;
                Ok(vec![request.reply(0)])
            },
            MessageType::Dump => {
                self.dump(consumer, request)?;
                Ok(vec![request.reply(0)])
            },
            MessageType::Flush => {
                match request.assoc_type {
                    0 => reg.flush(),
                    _ => reg.flush_type(request.sa_type()?),
                };
                Ok(vec![request.reply(0)])
            },
            // Kernel to daemon only
            MessageType::Acquire => Err(SaError::Unsupported),
        }
    }

    fn ok(request: &KeyMessage, state: SaState) -> KeyMessage {
        let mut reply = request.reply(0);
        reply.state = state as u8;
        reply
    }

    /// Push every exportable record, `seq` counting down to 1, then a
    /// terminator with `seq` 0
    fn dump(&self, consumer: ConsumerId, request: &KeyMessage) -> SaResult<()> {
        let filter = match request.assoc_type {
            0 => None,
            _ => Some(request.sa_type()?),
        };
        let records: Vec<_> = self
            .registry
            .dump()
            .filter(|sa| filter.map_or(true, |t: SaType| sa.sa_type() == t))
            .collect();

        let transport = self.registry.transport();
        let total = records.len() as u32;

        for (i, sa) in records.iter().enumerate() {
            let mut msg = KeyMessage::from_record(MessageType::Dump, sa);
            msg.pid = request.pid;
            msg.seq = total - i as u32;
            if !transport.deliver_dump(consumer, &msg) {
                return Err(SaError::OutOfResources);
            }
        }

        let terminator = KeyMessage {
            pid: request.pid,
            assoc_type: request.assoc_type,
            ..KeyMessage::new(MessageType::Dump)
        };
        if !transport.deliver_dump(consumer, &terminator) {
            return Err(SaError::OutOfResources);
        }

        log::debug!("ipsec: dumped {} associations to {}", total, consumer);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use core::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::error::errno;
    use crate::testing::Fixture;

    const DAEMON: ConsumerId = ConsumerId(42);

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    fn request(msg_type: MessageType, spi: u32) -> KeyMessage {
        KeyMessage {
            pid: 100,
            seq: 9,
            assoc_type: SaType::Esp as u8,
            spi,
            src: Some(addr(1)),
            dst: Some(addr(2)),
            key: vec![0x11; 16],
            ..KeyMessage::new(msg_type)
        }
    }

    #[test]
    fn test_add_get_delete_over_the_wire() {
        let fx = Fixture::new();
        let reg = fx.registry();
        let handler = ControlHandler::new(&reg);

        let mut add = request(MessageType::Add, 7);
        add.key = vec![0x5A; 16];
        let replies = handler.handle(DAEMON, &add);
        assert_eq!(replies[0].errno, 0);
        assert_eq!(replies[0].seq, 9);

        let got = handler.handle(DAEMON, &request(MessageType::Get, 7));
        assert_eq!(got[0].errno, 0);
        assert_eq!(got[0].key, [0x5A; 16]);
        assert_eq!(got[0].state, SaState::Complete as u8);

        let del = handler.handle(DAEMON, &request(MessageType::Delete, 7));
        assert_eq!(del[0].errno, 0);
        let del = handler.handle(DAEMON, &request(MessageType::Delete, 7));
        assert_eq!(del[0].errno, errno::ESRCH);

        let got = handler.handle(DAEMON, &request(MessageType::Get, 7));
        assert_eq!(got[0].errno, errno::ESRCH);
    }

    #[test]
    fn test_errors_become_errno() {
        let fx = Fixture::new();
        let reg = fx.registry();
        let handler = ControlHandler::new(&reg);

        handler.handle(DAEMON, &request(MessageType::Add, 7));
        let dup = handler.handle(DAEMON, &request(MessageType::Add, 7));
        assert_eq!(dup[0].errno, errno::EEXIST);

        let acquire = handler.handle(DAEMON, &request(MessageType::Acquire, 0));
        assert_eq!(acquire[0].errno, errno::EOPNOTSUPP);

        let mut no_dst = request(MessageType::Add, 8);
        no_dst.dst = None;
        assert_eq!(handler.handle(DAEMON, &no_dst)[0].errno, errno::EINVAL);

        let mut bad_type = request(MessageType::Add, 8);
        bad_type.assoc_type = 4;
        assert_eq!(handler.handle(DAEMON, &bad_type)[0].errno, errno::EINVAL);
    }

    #[test]
    fn test_keyless_add_and_update_rejected() {
        let fx = Fixture::new();
        let reg = fx.registry();
        let handler = ControlHandler::new(&reg);

        let mut add = request(MessageType::Add, 7);
        add.key.clear();
        assert_eq!(handler.handle(DAEMON, &add)[0].errno, errno::EINVAL);
        assert!(reg.is_empty());

        handler.handle(DAEMON, &request(MessageType::Add, 7));
        let mut update = request(MessageType::Update, 7);
        update.key.clear();
        assert_eq!(handler.handle(DAEMON, &update)[0].errno, errno::EINVAL);
        assert_eq!(
            handler.handle(DAEMON, &request(MessageType::Get, 7))[0].key,
            [0x11; 16]
        );
    }

    #[test]
    fn test_getspi_then_update() {
        let fx = Fixture::new();
        let reg = fx.registry();
        let handler = ControlHandler::new(&reg);

        let mut getspi = request(MessageType::GetSpi, 0);
        getspi.lifetime_1 = 100;
        getspi.lifetime_2 = 100;
        let reply = handler.handle(DAEMON, &getspi);
        assert_eq!(reply[0].errno, 0);
        assert_eq!(reply[0].spi, 100);
        assert_eq!(reply[0].state, SaState::Provisional as u8);

        let again = handler.handle(DAEMON, &getspi);
        assert_eq!(again[0].errno, errno::EADDRNOTAVAIL);

        let mut update = request(MessageType::Update, 100);
        update.key = vec![1; 8];
        assert_eq!(handler.handle(DAEMON, &update)[0].errno, 0);
        assert_eq!(
            handler.handle(DAEMON, &request(MessageType::Get, 100))[0].key,
            [1; 8]
        );
    }

    #[test]
    fn test_dump_sequence_and_terminator() {
        let fx = Fixture::new();
        let reg = fx.registry();
        let handler = ControlHandler::new(&reg);
        for spi in [11, 12, 13] {
            handler.handle(DAEMON, &request(MessageType::Add, spi));
        }

        let ack = handler.handle(DAEMON, &request(MessageType::Dump, 0));
        assert_eq!(ack[0].errno, 0);

        let dumped = fx.transport.dumps();
        let seqs: Vec<u32> = dumped.iter().map(|(_, m)| m.seq).collect();
        assert_eq!(seqs, [3, 2, 1, 0]);
        assert!(dumped.iter().all(|(c, _)| *c == DAEMON));
        assert_eq!(dumped[3].1.src, None);
    }

    #[test]
    fn test_register_and_flush() {
        let fx = Fixture::new();
        let reg = fx.registry();
        let handler = ControlHandler::new(&reg);

        let register = request(MessageType::Register, 0);
        assert_eq!(handler.handle(DAEMON, &register)[0].errno, 0);
        assert_eq!(handler.handle(DAEMON, &register)[0].errno, errno::EEXIST);

        handler.handle(DAEMON, &request(MessageType::Add, 1));
        handler.handle(DAEMON, &request(MessageType::Add, 2));
        let mut flush = request(MessageType::Flush, 0);
        flush.assoc_type = 0;
        assert_eq!(handler.handle(DAEMON, &flush)[0].errno, 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_handle_bytes() {
        let fx = Fixture::new();
        let reg = fx.registry();
        let handler = ControlHandler::new(&reg);

        let wire = request(MessageType::Add, 5).encode().unwrap();
        let replies = handler.handle_bytes(DAEMON, &wire).unwrap();
        let reply = KeyMessage::decode(&replies[0]).unwrap();
        assert_eq!(reply.errno, 0);
        assert_eq!(reply.spi, 5);

        assert_eq!(
            handler.handle_bytes(DAEMON, &wire[..10]),
            Err(SaError::InvalidArgument)
        );
    }
}
