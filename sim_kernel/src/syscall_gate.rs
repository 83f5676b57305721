//! Syscall gate for the user/kernel boundary.
//!
//! Applications enter the kernel only through a trap number and four raw
//! argument words. The gate looks the number up in a table that is built
//! once and never changes, decodes the arguments against the caller's
//! [`UserMemory`] and collapses the outcome into a status word: the
//! non-negative result, or the negative code of a [`KernelError`].

use crate::user_memory::UserMemory;
use crate::SimulatedKernel;
use core_types::{AppUuid, HandleId, MsgId};
use kernel_api::{
    to_status, ConnectFlags, IovecUser, IpcMsgUser, KernelError, KernelResult, MsgInfo,
    PortFlags, SendFlags, SyscallNr, Timeout, UEvent,
};
use lifecycle::App;
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

/// Everything a syscall handler may touch
pub struct SyscallCtx<'a> {
    pub kernel: &'a SimulatedKernel,
    pub app: &'a App,
    pub mem: &'a mut UserMemory,
}

pub type SyscallHandler = fn(&mut SyscallCtx<'_>, [u64; 4]) -> KernelResult<i64>;

#[derive(Debug, Clone, Copy)]
pub struct SyscallEntry {
    pub nr: SyscallNr,
    pub handler: SyscallHandler,
}

/// Trap number to handler map
#[derive(Debug)]
pub struct SyscallTable {
    entries: HashMap<u32, SyscallEntry>,
}

impl SyscallTable {
    fn build() -> Self {
        let handlers: [(SyscallNr, SyscallHandler); 11] = [
            (SyscallNr::PortCreate, port_create),
            (SyscallNr::Connect, connect),
            (SyscallNr::Accept, accept),
            (SyscallNr::Close, close),
            (SyscallNr::SetCookie, set_cookie),
            (SyscallNr::Wait, wait),
            (SyscallNr::WaitAny, wait_any),
            (SyscallNr::GetMsg, get_msg),
            (SyscallNr::ReadMsg, read_msg),
            (SyscallNr::PutMsg, put_msg),
            (SyscallNr::SendMsg, send_msg),
        ];
        let entries = handlers
            .into_iter()
            .map(|(nr, handler)| (nr as u32, SyscallEntry { nr, handler }))
            .collect();
        Self { entries }
    }

    /// The kernel's table, built on first use
    pub fn global() -> &'static SyscallTable {
        static TABLE: OnceLock<SyscallTable> = OnceLock::new();
        TABLE.get_or_init(SyscallTable::build)
    }

    pub fn lookup(&self, raw: u32) -> Option<&SyscallEntry> {
        self.entries.get(&raw)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Syscall audit event (for testing and verification).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyscallEvent {
    /// Syscall was invoked
    Invoked {
        caller: AppUuid,
        syscall_name: String,
        timestamp_nanos: u64,
    },
    /// Syscall returned a non-negative result
    Completed {
        caller: AppUuid,
        syscall_name: String,
        result: i64,
        timestamp_nanos: u64,
    },
    /// Syscall failed or was not recognized
    Rejected {
        caller: AppUuid,
        syscall_name: String,
        reason: String,
        timestamp_nanos: u64,
    },
}

/// Audit log for syscall operations.
#[derive(Debug, Clone, Default)]
pub struct SyscallAuditLog {
    events: Vec<SyscallEvent>,
}

impl SyscallAuditLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: SyscallEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[SyscallEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&SyscallEvent) -> bool,
    {
        self.events.iter().any(predicate)
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SyscallEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).count()
    }
}

/// The only way applications reach the kernel
pub struct SyscallGate {
    table: &'static SyscallTable,
    audit_log: Mutex<SyscallAuditLog>,
    started: Instant,
}

impl SyscallGate {
    pub fn new() -> Self {
        Self {
            table: SyscallTable::global(),
            audit_log: Mutex::new(SyscallAuditLog::new()),
            started: Instant::now(),
        }
    }

    fn log(&self) -> MutexGuard<'_, SyscallAuditLog> {
        self.audit_log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of the audit log (test-only)
    pub fn audit_log(&self) -> SyscallAuditLog {
        self.log().clone()
    }

    /// Clears the audit log (test-only)
    pub fn clear_audit_log(&self) {
        self.log().clear();
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Executes trap `nr` on behalf of `app`
    ///
    /// Returns the status word handed back to the application. Unknown trap
    /// numbers fail with [`KernelError::NotSupported`].
    pub fn dispatch(
        &self,
        kernel: &SimulatedKernel,
        app: &App,
        mem: &mut UserMemory,
        nr: u32,
        args: [u64; 4],
    ) -> i64 {
        let caller = app.uuid();
        let Some(entry) = self.table.lookup(nr) else {
            warn!("{}: unknown syscall {:#x}", caller, nr);
            self.log().record(SyscallEvent::Rejected {
                caller,
                syscall_name: format!("unknown({:#x})", nr),
                reason: format!("{:?}", KernelError::NotSupported),
                timestamp_nanos: self.now_nanos(),
            });
            return KernelError::NotSupported.status();
        };
        let syscall_name = entry.nr.name().to_string();
        self.log().record(SyscallEvent::Invoked {
            caller,
            syscall_name: syscall_name.clone(),
            timestamp_nanos: self.now_nanos(),
        });
        trace!("{}: {} {:x?}", caller, syscall_name, args);

        let mut cx = SyscallCtx { kernel, app, mem };
        let result = (entry.handler)(&mut cx, args);

        let timestamp_nanos = self.now_nanos();
        match &result {
            Ok(value) => self.log().record(SyscallEvent::Completed {
                caller,
                syscall_name,
                result: *value,
                timestamp_nanos,
            }),
            Err(err) => self.log().record(SyscallEvent::Rejected {
                caller,
                syscall_name,
                reason: format!("{:?}", err),
                timestamp_nanos,
            }),
        }
        to_status(result)
    }
}

impl Default for SyscallGate {
    fn default() -> Self {
        Self::new()
    }
}

fn arg_u32(raw: u64) -> KernelResult<u32> {
    u32::try_from(raw).map_err(|_| KernelError::InvalidArgs)
}

fn arg_usize(raw: u64) -> KernelResult<usize> {
    usize::try_from(raw).map_err(|_| KernelError::InvalidArgs)
}

fn arg_handle(raw: u64) -> KernelResult<HandleId> {
    u32::try_from(raw)
        .map(HandleId::new)
        .map_err(|_| KernelError::InvalidHandle)
}

fn handle_result(id: HandleId) -> i64 {
    i64::from(id.as_u32())
}

fn read_msg_desc(mem: &UserMemory, addr: u64) -> KernelResult<IpcMsgUser> {
    let mut raw = [0u8; IpcMsgUser::SIZE];
    mem.copy_from_user(&mut raw, addr)?;
    Ok(IpcMsgUser::from_bytes(&raw))
}

fn read_iovecs(cx: &SyscallCtx<'_>, desc: &IpcMsgUser) -> KernelResult<Vec<IovecUser>> {
    let count = desc.num_iov as usize;
    if count > cx.kernel.config().max_iovecs {
        return Err(KernelError::TooBig);
    }
    (0..count)
        .map(|i| {
            let mut raw = [0u8; IovecUser::SIZE];
            let addr = desc.iov + (i * IovecUser::SIZE) as u64;
            cx.mem.copy_from_user(&mut raw, addr)?;
            Ok(IovecUser::from_bytes(&raw))
        })
        .collect()
}

fn port_create(cx: &mut SyscallCtx<'_>, args: [u64; 4]) -> KernelResult<i64> {
    let path = cx
        .mem
        .strncpy_from_user(args[0], cx.kernel.config().port_path_max)?;
    let flags = PortFlags::from_bits(arg_u32(args[3])?).ok_or(KernelError::InvalidArgs)?;
    let id = cx.kernel.sys_port_create(
        cx.app,
        &path,
        arg_usize(args[1])?,
        arg_usize(args[2])?,
        flags,
    )?;
    Ok(handle_result(id))
}

fn connect(cx: &mut SyscallCtx<'_>, args: [u64; 4]) -> KernelResult<i64> {
    let flags = ConnectFlags::from_bits(arg_u32(args[1])?).ok_or(KernelError::InvalidArgs)?;
    let path = cx
        .mem
        .strncpy_from_user(args[0], cx.kernel.config().port_path_max)?;
    let id = cx.kernel.sys_connect(cx.app, &path, flags)?;
    Ok(handle_result(id))
}

fn accept(cx: &mut SyscallCtx<'_>, args: [u64; 4]) -> KernelResult<i64> {
    let port_id = arg_handle(args[0])?;
    cx.mem.check_writable(args[1], 16)?;
    let (id, peer) = cx.kernel.sys_accept(cx.app, port_id)?;
    if let Err(err) = cx.mem.copy_to_user(args[1], peer.as_bytes()) {
        let _ = cx.kernel.sys_close(cx.app, id);
        return Err(err);
    }
    Ok(handle_result(id))
}

fn close(cx: &mut SyscallCtx<'_>, args: [u64; 4]) -> KernelResult<i64> {
    cx.kernel.sys_close(cx.app, arg_handle(args[0])?)?;
    Ok(0)
}

fn set_cookie(cx: &mut SyscallCtx<'_>, args: [u64; 4]) -> KernelResult<i64> {
    cx.kernel.sys_set_cookie(cx.app, arg_handle(args[0])?, args[1])?;
    Ok(0)
}

fn write_event(cx: &mut SyscallCtx<'_>, addr: u64, event: &UEvent) -> KernelResult<i64> {
    cx.mem.copy_to_user(addr, &event.to_bytes())?;
    Ok(0)
}

fn wait(cx: &mut SyscallCtx<'_>, args: [u64; 4]) -> KernelResult<i64> {
    let id = arg_handle(args[0])?;
    cx.mem.check_writable(args[1], UEvent::SIZE)?;
    let event = cx
        .kernel
        .sys_wait(cx.app, id, Timeout::from_millis(args[2]))?;
    write_event(cx, args[1], &event)
}

fn wait_any(cx: &mut SyscallCtx<'_>, args: [u64; 4]) -> KernelResult<i64> {
    cx.mem.check_writable(args[0], UEvent::SIZE)?;
    let event = cx
        .kernel
        .sys_wait_any(cx.app, Timeout::from_millis(args[1]))?;
    write_event(cx, args[0], &event)
}

fn get_msg(cx: &mut SyscallCtx<'_>, args: [u64; 4]) -> KernelResult<i64> {
    let id = arg_handle(args[0])?;
    cx.mem.check_writable(args[1], MsgInfo::SIZE)?;
    let info = cx.kernel.sys_get_msg(cx.app, id)?;
    cx.mem.copy_to_user(args[1], &info.to_bytes())?;
    Ok(0)
}

fn read_msg(cx: &mut SyscallCtx<'_>, args: [u64; 4]) -> KernelResult<i64> {
    let id = arg_handle(args[0])?;
    let msg_id = MsgId::new(arg_u32(args[1])?);
    let offset = arg_usize(args[2])?;
    let desc = read_msg_desc(cx.mem, args[3])?;
    let iovecs = read_iovecs(cx, &desc)?;
    for iov in iovecs.iter().filter(|iov| iov.len > 0) {
        cx.mem.check_writable(iov.base, arg_usize(iov.len)?)?;
    }
    let max_handles = desc.num_handles as usize;
    if max_handles > 0 {
        cx.mem.check_writable(desc.handles, max_handles * 4)?;
    }

    let mut bufs = iovecs
        .iter()
        .map(|iov| arg_usize(iov.len).map(|len| vec![0u8; len]))
        .collect::<KernelResult<Vec<_>>>()?;
    let mut dst: Vec<&mut [u8]> = bufs.iter_mut().map(Vec::as_mut_slice).collect();
    let len = cx.kernel.sys_read_msg(cx.app, id, msg_id, offset, &mut dst)?;

    if max_handles > 0 {
        let ids = cx.kernel.sys_recv_handles(cx.app, id, msg_id, max_handles)?;
        let raw: Vec<u8> = ids
            .iter()
            .flat_map(|received| received.as_u32().to_le_bytes())
            .collect();
        if !raw.is_empty() {
            if let Err(err) = cx.mem.copy_to_user(desc.handles, &raw) {
                cx.kernel.unrecv_handles(cx.app, id, msg_id, &ids)?;
                return Err(err);
            }
        }
    }

    let mut left = len;
    for (iov, buf) in iovecs.iter().zip(&bufs) {
        let n = left.min(buf.len());
        if n > 0 {
            cx.mem.copy_to_user(iov.base, &buf[..n])?;
        }
        left -= n;
    }
    i64::try_from(len).map_err(|_| KernelError::TooBig)
}

fn put_msg(cx: &mut SyscallCtx<'_>, args: [u64; 4]) -> KernelResult<i64> {
    let id = arg_handle(args[0])?;
    cx.kernel
        .sys_put_msg(cx.app, id, MsgId::new(arg_u32(args[1])?))?;
    Ok(0)
}

fn send_msg(cx: &mut SyscallCtx<'_>, args: [u64; 4]) -> KernelResult<i64> {
    let id = arg_handle(args[0])?;
    let flags = SendFlags::from_bits(arg_u32(args[2])?).ok_or(KernelError::InvalidArgs)?;
    let desc = read_msg_desc(cx.mem, args[1])?;
    let iovecs = read_iovecs(cx, &desc)?;
    let num_handles = desc.num_handles as usize;
    if num_handles > cx.kernel.config().max_msg_handles {
        return Err(KernelError::BadLen);
    }

    let mut total = 0usize;
    for iov in &iovecs {
        let len = arg_usize(iov.len).map_err(|_| KernelError::BadLen)?;
        total = total.checked_add(len).ok_or(KernelError::BadLen)?;
        if total > cx.kernel.config().max_chan_buf_size {
            return Err(KernelError::BadLen);
        }
        if len > 0 {
            cx.mem.check_readable(iov.base, len)?;
        }
    }

    let mut payload = Vec::with_capacity(iovecs.len());
    for iov in &iovecs {
        let mut segment = vec![0u8; arg_usize(iov.len)?];
        if !segment.is_empty() {
            cx.mem.copy_from_user(&mut segment, iov.base)?;
        }
        payload.push(segment);
    }
    let handle_ids = (0..num_handles)
        .map(|i| cx.mem.read_u32(desc.handles + (i * 4) as u64).map(HandleId::new))
        .collect::<KernelResult<Vec<_>>>()?;

    let segments: Vec<&[u8]> = payload.iter().map(Vec::as_slice).collect();
    let sent = cx
        .kernel
        .sys_send_msg(cx.app, id, &segments, &handle_ids, flags)?;
    i64::try_from(sent).map_err(|_| KernelError::TooBig)
}
