//! Typed syscalls
//!
//! One method per entry of the syscall table, taking already-decoded
//! arguments. The caller is always an application; every id is resolved
//! through its own user context.

use crate::uctx::UserContext;
use crate::SimulatedKernel;
use core_types::{AppUuid, HandleId, MsgId};
use ipc::{ChannelEnd, HandleRef, PortParams};
use kernel_api::{
    ConnectFlags, KernelError, KernelResult, MsgInfo, PortFlags, SendFlags, Timeout, UEvent,
};
use lifecycle::App;
use log::trace;
use std::sync::Arc;

/// A channel handle borrowed from a user context for one call
struct ChannelRef {
    _handle: HandleRef,
    end: Arc<ChannelEnd>,
}

impl ChannelRef {
    fn end(&self) -> &ChannelEnd {
        &self.end
    }
}

impl SimulatedKernel {
    fn channel(&self, uctx: &UserContext, id: HandleId) -> KernelResult<ChannelRef> {
        let handle = uctx.get(id)?;
        let end = handle
            .as_channel()
            .map_err(|_| KernelError::InvalidArgs)?
            .clone();
        Ok(ChannelRef {
            _handle: handle,
            end,
        })
    }

    /// Creates and publishes a port owned by `app`
    pub fn sys_port_create(
        &self,
        app: &App,
        path: &str,
        num_recv_bufs: usize,
        recv_buf_size: usize,
        flags: PortFlags,
    ) -> KernelResult<HandleId> {
        trace!("{}: port_create '{}'", app.uuid(), path);
        let uctx = self.uctx(app)?;
        let params = PortParams {
            num_recv_bufs,
            recv_buf_size,
            flags,
        };
        let port = self.registry().port_create(app.uuid(), path, params)?;
        let id = uctx.install(port.clone())?;
        if let Err(err) = self.registry().publish(&port) {
            if let Ok(installed) = uctx.remove(id) {
                installed.close();
            }
            return Err(err);
        }
        Ok(id)
    }

    /// Connects `app` to the port at `path`
    pub fn sys_connect(&self, app: &App, path: &str, flags: ConnectFlags) -> KernelResult<HandleId> {
        trace!("{}: connect '{}' {:?}", app.uuid(), path, flags);
        let uctx = self.uctx(app)?;
        // a handle that does not fit is destroyed, which hangs up the link
        let channel = self.registry().connect(app.uuid(), path, flags)?;
        uctx.install(channel)
    }

    /// Accepts a pending connection on the port at `port_id`
    pub fn sys_accept(&self, app: &App, port_id: HandleId) -> KernelResult<(HandleId, AppUuid)> {
        let uctx = self.uctx(app)?;
        let port_handle = uctx.get(port_id)?;
        let port = port_handle.as_port().map_err(|_| KernelError::InvalidArgs)?;
        let (channel, peer) = port.accept()?;
        let id = uctx.install(channel)?;
        trace!("{}: accepted {} as {}", app.uuid(), peer, id);
        Ok((id, peer))
    }

    /// Releases `id` from the caller's table and closes the handle
    pub fn sys_close(&self, app: &App, id: HandleId) -> KernelResult<()> {
        let handle = self.uctx(app)?.remove(id)?;
        handle.close();
        Ok(())
    }

    pub fn sys_set_cookie(&self, app: &App, id: HandleId, cookie: u64) -> KernelResult<()> {
        self.uctx(app)?.get(id)?.set_cookie(cookie);
        Ok(())
    }

    /// Waits for one handle
    pub fn sys_wait(&self, app: &App, id: HandleId, timeout: Timeout) -> KernelResult<UEvent> {
        let handle = self.uctx(app)?.get(id)?;
        let event = handle.wait(timeout)?;
        Ok(UEvent {
            handle: id,
            event,
            cookie: handle.cookie(),
        })
    }

    /// Waits for any handle of the caller
    pub fn sys_wait_any(&self, app: &App, timeout: Timeout) -> KernelResult<UEvent> {
        self.uctx(app)?.wait_any(timeout)
    }

    /// Describes the next message without retrieving it
    pub fn sys_peek_msg(&self, app: &App, id: HandleId) -> KernelResult<MsgInfo> {
        let uctx = self.uctx(app)?;
        self.channel(&uctx, id)?.end().peek_msg()
    }

    /// Retrieves the next message for reading
    pub fn sys_get_msg(&self, app: &App, id: HandleId) -> KernelResult<MsgInfo> {
        let uctx = self.uctx(app)?;
        self.channel(&uctx, id)?.end().get_msg()
    }

    /// Copies payload of a retrieved message, starting at `offset`
    pub fn sys_read_msg(
        &self,
        app: &App,
        id: HandleId,
        msg_id: MsgId,
        offset: usize,
        dst: &mut [&mut [u8]],
    ) -> KernelResult<usize> {
        let uctx = self.uctx(app)?;
        self.channel(&uctx, id)?.end().read_msg(msg_id, offset, dst)
    }

    /// Installs the handles carried by a retrieved message
    ///
    /// Fails with [`KernelError::BadLen`] if the message carries more than
    /// `max` handles. On any failure the handles stay with the message.
    pub fn sys_recv_handles(
        &self,
        app: &App,
        id: HandleId,
        msg_id: MsgId,
        max: usize,
    ) -> KernelResult<Vec<HandleId>> {
        let uctx = self.uctx(app)?;
        let channel = self.channel(&uctx, id)?;
        let end = channel.end();
        let handles = end.take_msg_handles(msg_id)?;
        if handles.len() > max {
            end.restore_msg_handles(msg_id, handles)?;
            return Err(KernelError::BadLen);
        }
        match uctx.install_all(handles) {
            Ok(ids) => Ok(ids),
            Err((err, handles)) => {
                end.restore_msg_handles(msg_id, handles)?;
                Err(err)
            }
        }
    }

    /// Puts received handles back into their message
    pub(crate) fn unrecv_handles(
        &self,
        app: &App,
        id: HandleId,
        msg_id: MsgId,
        ids: &[HandleId],
    ) -> KernelResult<()> {
        let uctx = self.uctx(app)?;
        let channel = self.channel(&uctx, id)?;
        let handles = ids
            .iter()
            .filter_map(|&received| uctx.remove(received).ok())
            .collect();
        channel.end().restore_msg_handles(msg_id, handles)
    }

    /// Releases a retrieved message
    pub fn sys_put_msg(&self, app: &App, id: HandleId, msg_id: MsgId) -> KernelResult<()> {
        let uctx = self.uctx(app)?;
        self.channel(&uctx, id)?.end().put_msg(msg_id)
    }

    /// Sends a message, moving `handle_ids` out of the caller's table
    ///
    /// Without NONBLOCK the call waits for a free slot in the peer's queue;
    /// with it a full queue fails with [`KernelError::WouldBlock`]. The
    /// transferred ids are reserved for the duration of the send: they name
    /// nothing and cannot be reused until it settles. A failed send puts the
    /// handles back under the same ids.
    pub fn sys_send_msg(
        &self,
        app: &App,
        id: HandleId,
        segments: &[&[u8]],
        handle_ids: &[HandleId],
        flags: SendFlags,
    ) -> KernelResult<usize> {
        let uctx = self.uctx(app)?;
        let channel = self.channel(&uctx, id)?;
        if handle_ids.len() > self.config().max_msg_handles {
            return Err(KernelError::BadLen);
        }
        for (i, &transfer) in handle_ids.iter().enumerate() {
            if transfer == id || handle_ids[..i].contains(&transfer) {
                return Err(KernelError::InvalidArgs);
            }
        }
        let mut handles = uctx.reserve(handle_ids)?;

        let result = if flags.contains(SendFlags::NONBLOCK) {
            channel
                .end()
                .send_msg(segments, &mut handles)
                .map_err(|err| match err {
                    KernelError::QueueFull => KernelError::WouldBlock,
                    other => other,
                })
        } else {
            channel
                .end()
                .send_msg_blocking(segments, &mut handles, Timeout::INFINITE)
        };

        match result {
            Ok(sent) => {
                uctx.release_reserved(handle_ids);
                trace!(
                    "{}: sent {} bytes and {} handles on {}",
                    app.uuid(),
                    sent,
                    handle_ids.len(),
                    id
                );
                Ok(sent)
            }
            Err(err) => {
                uctx.restore_reserved(handle_ids, handles);
                Err(err)
            }
        }
    }
}
