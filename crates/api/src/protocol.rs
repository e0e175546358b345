//! The message-kind enumeration and its wire numbering.
//!
//! Every ElGA message begins with a one-byte kind. The numbering is part of
//! the wire protocol and must not change between versions. Directive kinds
//! (`START`, `SAVE`, ...) have a rebroadcast `DO_*` form at kind + 0x40,
//! produced by directories when forwarding client directives to agents.

/// Offset between a directive kind and its rebroadcast `DO_*` form.
pub const DO_ADD: u8 = 0x40;

/// A one-byte message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum MsgKind {
    Shutdown = 0x01,
    GetDirectories = 0x02,
    GetDirectory = 0x03,
    DirectoryJoin = 0x04,
    DirectoryLeave = 0x05,
    Query = 0x06,
    AgentJoin = 0x07,
    AgentLeave = 0x08,
    DirectoryUpdate = 0x09,
    Disconnect = 0x0a,
    NeedDirectory = 0x0b,
    UpdateEdge = 0x0c,
    UpdateEdges = 0x0d,
    SendUpdates = 0x0e,
    AckUpdates = 0x0f,
    Start = 0x10,
    Save = 0x11,
    Dump = 0x12,
    ReadyNvNe = 0x13,
    ReadyNvNeInt = 0x14,
    Nv = 0x15,
    Rv = 0x16,
    ReadySync = 0x17,
    ReadySyncInt = 0x18,
    Sync = 0x19,
    HaveUpdate = 0x1a,
    OutVn = 0x1b,
    Update = 0x1c,
    Reset = 0x1d,
    ChkT = 0x1e,
    Va = 0x1f,
    CsUpdate = 0x20,
    CsLb = 0x21,
    SimpleSync = 0x22,
    SimpleSyncDone = 0x23,

    DoStart = 0x50,
    DoSave = 0x51,
    DoDump = 0x52,
    DoUpdate = 0x5c,
    DoReset = 0x5d,
    DoChkT = 0x5e,
    DoVa = 0x5f,
    DoCsLb = 0x61,

    Heartbeat = 0xff,
}

impl MsgKind {
    /// Decode a kind byte. Unknown bytes are left to the caller, which
    /// treats them as protocol errors.
    pub fn from_u8(b: u8) -> Option<Self> {
        use MsgKind::*;
        Some(match b {
            0x01 => Shutdown,
            0x02 => GetDirectories,
            0x03 => GetDirectory,
            0x04 => DirectoryJoin,
            0x05 => DirectoryLeave,
            0x06 => Query,
            0x07 => AgentJoin,
            0x08 => AgentLeave,
            0x09 => DirectoryUpdate,
            0x0a => Disconnect,
            0x0b => NeedDirectory,
            0x0c => UpdateEdge,
            0x0d => UpdateEdges,
            0x0e => SendUpdates,
            0x0f => AckUpdates,
            0x10 => Start,
            0x11 => Save,
            0x12 => Dump,
            0x13 => ReadyNvNe,
            0x14 => ReadyNvNeInt,
            0x15 => Nv,
            0x16 => Rv,
            0x17 => ReadySync,
            0x18 => ReadySyncInt,
            0x19 => Sync,
            0x1a => HaveUpdate,
            0x1b => OutVn,
            0x1c => Update,
            0x1d => Reset,
            0x1e => ChkT,
            0x1f => Va,
            0x20 => CsUpdate,
            0x21 => CsLb,
            0x22 => SimpleSync,
            0x23 => SimpleSyncDone,
            0x50 => DoStart,
            0x51 => DoSave,
            0x52 => DoDump,
            0x5c => DoUpdate,
            0x5d => DoReset,
            0x5e => DoChkT,
            0x5f => DoVa,
            0x61 => DoCsLb,
            0xff => Heartbeat,
            _ => return None,
        })
    }

    /// The rebroadcast `DO_*` form of a directive kind, if it has one.
    pub fn to_do(self) -> Option<Self> {
        use MsgKind::*;
        Some(match self {
            Start => DoStart,
            Save => DoSave,
            Dump => DoDump,
            Update => DoUpdate,
            Reset => DoReset,
            ChkT => DoChkT,
            Va => DoVa,
            CsLb => DoCsLb,
            _ => return None,
        })
    }

    /// Whether this is a directive a directory master acks and passes
    /// through to directories.
    pub fn is_directive(self) -> bool {
        self.to_do().is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_bytes_round_trip() {
        for b in 0u8..=0xff {
            if let Some(k) = MsgKind::from_u8(b) {
                assert_eq!(b, k as u8);
            }
        }
    }

    #[test]
    fn do_offset_is_fixed() {
        for k in [
            MsgKind::Start,
            MsgKind::Save,
            MsgKind::Dump,
            MsgKind::Update,
            MsgKind::Reset,
            MsgKind::ChkT,
            MsgKind::Va,
            MsgKind::CsLb,
        ] {
            let d = k.to_do().unwrap();
            assert_eq!(k as u8 + DO_ADD, d as u8);
        }
        assert!(MsgKind::Sync.to_do().is_none());
    }
}
