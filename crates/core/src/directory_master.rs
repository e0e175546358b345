//! The directory master: the cluster's bootstrapping rendezvous.
//!
//! Runs once per cluster. Directory servers register here; every other
//! component asks it for a directory to use. Client directives are
//! acknowledged and passed through to the directory subscribers.

use crate::chatterbox::{Chatterbox, Incoming, Replier};
use crate::ctx::ProcessCtx;
use bytes::Bytes;
use elga_api::{Address, ElgaError, ElgaResult, MsgKind, Packer, Unpacker};
use rand::Rng;
use std::time::Duration;

/// The singleton authority for the list of directory servers.
pub struct DirectoryMaster {
    chat: Chatterbox,
    directories: Vec<u64>,
}

impl DirectoryMaster {
    /// Bind the master at `addr`.
    pub fn new(ctx: &ProcessCtx, addr: Address) -> ElgaResult<Self> {
        Ok(Self {
            chat: Chatterbox::bind(ctx, addr)?,
            directories: Vec::new(),
        })
    }

    /// Serve until shutdown.
    pub fn run(&mut self) -> ElgaResult<()> {
        tracing::debug!("directory master running");
        let ctx = self.chat.ctx().clone();
        let timeout = Duration::from_millis(ctx.tunables.poll_timeout_ms);

        let mut keep_running = true;
        while keep_running {
            if ctx.shutdown_requested() {
                tracing::debug!("initiating shutdown");
                self.chat
                    .publish(Bytes::copy_from_slice(&[MsgKind::Shutdown as u8]));
                // Give the broadcast a moment to flush.
                std::thread::sleep(Duration::from_millis(10));
                break;
            }

            self.chat.heartbeat(true);

            for m in self.chat.poll(timeout) {
                let (data, replier) = match m {
                    Incoming::Request(d, r) => (d, Some(r)),
                    Incoming::Publication(d) | Incoming::Push(d) => (d, None),
                };
                if data.is_empty() {
                    return Err(ElgaError::protocol("message too small"));
                }
                let kind = MsgKind::from_u8(data[0]).ok_or_else(|| {
                    ElgaError::protocol(format!("unknown message byte {:#x}", data[0]))
                })?;
                tracing::trace!(?kind, "got query");

                match kind {
                    MsgKind::GetDirectories => {
                        self.get_directories(&required(replier)?)?;
                    }
                    MsgKind::GetDirectory => {
                        self.get_directory(&required(replier)?)?;
                    }
                    MsgKind::Shutdown => {
                        required(replier)?.ack()?;
                        self.chat.publish(data);
                        keep_running = false;
                    }
                    MsgKind::DirectoryJoin => {
                        required(replier)?.ack()?;
                        self.dir_join(&data)?;
                    }
                    MsgKind::DirectoryLeave => {
                        required(replier)?.ack()?;
                        self.dir_leave(&data)?;
                    }
                    k if k.is_directive() => {
                        required(replier)?.ack()?;
                        self.chat.publish(data);
                    }
                    MsgKind::Heartbeat => {}
                    _ => {
                        return Err(ElgaError::protocol(format!("unexpected message: {kind:?}")))
                    }
                }
            }
        }

        tracing::debug!("directory master stopping");
        Ok(())
    }

    fn get_directories(&mut self, replier: &Replier) -> ElgaResult<()> {
        tracing::info!(count = self.directories.len(), "returning full directory list");
        let mut p = Packer::with_capacity(self.directories.len() * 8);
        for &d in &self.directories {
            p.u64(d);
        }
        replier.reply(p.freeze())
    }

    fn get_directory(&mut self, replier: &Replier) -> ElgaResult<()> {
        if self.directories.is_empty() {
            return replier.ack();
        }
        let pick = rand::thread_rng().gen_range(0..self.directories.len());
        let mut p = Packer::new();
        p.u64(self.directories[pick]);
        replier.reply(p.freeze())
    }

    fn dir_join(&mut self, data: &Bytes) -> ElgaResult<()> {
        let serial = Unpacker::new(&data[1..]).u64()?;
        // Keep the list sorted so every reader sees the same order.
        if let Err(pos) = self.directories.binary_search(&serial) {
            self.directories.insert(pos, serial);
        }
        self.chat.publish(data.clone());
        tracing::debug!(serial, "processed join request");
        Ok(())
    }

    fn dir_leave(&mut self, data: &Bytes) -> ElgaResult<()> {
        let serial = Unpacker::new(&data[1..]).u64()?;
        if let Ok(pos) = self.directories.binary_search(&serial) {
            self.directories.remove(pos);
        }
        self.chat.publish(data.clone());
        tracing::debug!(serial, "processed leave request");
        Ok(())
    }
}

fn required(replier: Option<Replier>) -> ElgaResult<Replier> {
    replier.ok_or_else(|| ElgaError::protocol("directive arrived outside the reply socket"))
}
