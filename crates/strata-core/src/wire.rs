//! Wire message catalog.
//!
//! Every message is one variant of [`Msg`], tagged by its `message` field.
//! Requests carry a per-connection monotonic `msgid`; responses echo it as
//! `respid`. Bulk payloads (content, signatures, deltas) are not part of the
//! message body; they follow the header message as a framed byte stream
//! (see [`crate::framing`]).

use serde::{Deserialize, Serialize};

/// An `(inode, device)` pair, the engine-wide file identity.
pub type InodeId = (u64, u64);

/// Stat-derived description of one directory entry, filename already
/// encrypted. This is what a DIR message carries per file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub inode: u64,
    pub dev: u64,
    pub dir: bool,
    pub link: bool,
    pub nlinks: u64,
    pub size: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub atime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xattr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<String>,
}

impl FileInfo {
    pub fn inode_id(&self) -> InodeId {
        (self.inode, self.dev)
    }
}

/// One entry of a CKS message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CksumEntry {
    pub inode: InodeId,
    pub checksum: String,
}

/// One entry of a CLN message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneEntry {
    pub inode: u64,
    pub dev: u64,
    pub numfiles: u64,
    pub cksum: String,
}

/// Trailer closing a bulk byte stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkTrailer {
    pub status: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed: Option<String>,
}

/// The full message catalog, client and server sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message")]
pub enum Msg {
    // ---- session establishment ----
    #[serde(rename = "BACKUP")]
    Backup {
        host: String,
        time: f64,
        version: String,
        autoname: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        full: bool,
        priority: i64,
        force: bool,
        create: bool,
    },
    #[serde(rename = "NEEDKEYS")]
    NeedKeys {},
    #[serde(rename = "SETKEYS")]
    SetKeys {
        #[serde(rename = "cryptoScheme")]
        crypto_scheme: u8,
        #[serde(rename = "filenameKey")]
        filename_key: String,
        #[serde(rename = "contentKey")]
        content_key: String,
        #[serde(rename = "srpSalt")]
        srp_salt: String,
        #[serde(rename = "srpVkey")]
        srp_vkey: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "ACKSETKEYS")]
    AckSetKeys {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },
    #[serde(rename = "AUTH")]
    AuthChallenge {
        status: String,
        #[serde(rename = "cryptoScheme")]
        crypto_scheme: u8,
        client: String,
    },
    #[serde(rename = "AUTH1")]
    Auth1 {
        #[serde(rename = "srpUname")]
        srp_uname: String,
        #[serde(rename = "srpValueA")]
        srp_value_a: String,
    },
    #[serde(rename = "AUTH1-OK")]
    Auth1Ok {
        #[serde(rename = "srpValueS")]
        srp_value_s: String,
        #[serde(rename = "srpValueB")]
        srp_value_b: String,
    },
    #[serde(rename = "AUTH2")]
    Auth2 {
        #[serde(rename = "srpValueM")]
        srp_value_m: String,
    },
    #[serde(rename = "AUTH2-OK")]
    Auth2Ok {
        #[serde(rename = "srpValueHAMK")]
        srp_value_hamk: String,
    },
    #[serde(rename = "INIT")]
    Init {
        status: String,
        sessionid: String,
        #[serde(rename = "prevDate")]
        prev_date: f64,
        new: String,
        name: String,
        clientid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[serde(rename = "filenameKey")]
        filename_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[serde(rename = "contentKey")]
        content_key: Option<String>,
    },

    // ---- per-directory exchange ----
    #[serde(rename = "DIR")]
    Dir {
        path: String,
        inode: InodeId,
        files: Vec<FileInfo>,
        last: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "ACKDIR")]
    AckDir {
        status: String,
        path: String,
        inode: InodeId,
        last: bool,
        done: Vec<InodeId>,
        cksum: Vec<InodeId>,
        content: Vec<InodeId>,
        delta: Vec<InodeId>,
        refresh: Vec<InodeId>,
        xattrs: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },
    #[serde(rename = "DHSH")]
    DirHash {
        inode: InodeId,
        hash: String,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "ACKDHSH")]
    AckDirHash {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },

    // ---- signatures and transfers ----
    #[serde(rename = "SGR")]
    SigRequest {
        inode: InodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "SGS")]
    SigsRequest {
        inodes: Vec<InodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    /// Bidirectional: the server streams cached signatures down with
    /// `inode`/`checksum`/`size` set (terminated by `status = "DONE"`); the
    /// client uploads a freshly generated signature with just `checksum`.
    #[serde(rename = "SIG")]
    Sig {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inode: Option<InodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },
    #[serde(rename = "DEL")]
    Delta {
        checksum: String,
        basis: String,
        inode: InodeId,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deltasize: Option<u64>,
        encrypted: bool,
    },
    #[serde(rename = "CON")]
    Content {
        inode: InodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
        encrypted: bool,
    },
    #[serde(rename = "CKS")]
    Checksums {
        files: Vec<CksumEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "ACKSUM")]
    AckSum {
        status: String,
        done: Vec<InodeId>,
        content: Vec<InodeId>,
        delta: Vec<InodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },
    #[serde(rename = "CLN")]
    Clone {
        clones: Vec<CloneEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "ACKCLN")]
    AckClone {
        done: Vec<InodeId>,
        content: Vec<InodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },

    // ---- out-of-band metadata ----
    #[serde(rename = "META")]
    Meta {
        metadata: Vec<String>,
        encrypted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "ACKMETA")]
    AckMeta {
        done: Vec<String>,
        content: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },
    #[serde(rename = "METADATA")]
    MetaData {
        checksum: String,
        encrypted: bool,
    },

    // ---- batching, purge, diagnostics ----
    #[serde(rename = "BATCH")]
    Batch {
        batch: Vec<Msg>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "ACKBTCH")]
    AckBatch {
        responses: Vec<Msg>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },
    #[serde(rename = "PRG")]
    Purge {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
        relative: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "ACKPRG")]
    AckPurge {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },
    #[serde(rename = "CLICONFIG")]
    ClientConfig {
        args: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "ACKCLICONFIG")]
    AckClientConfig {
        saved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },
    #[serde(rename = "COMMANDLINE")]
    CommandLine {
        hash: String,
        line: String,
        size: u64,
        encrypted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "ACKCMDLN")]
    AckCommandLine {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },

    // ---- session teardown ----
    #[serde(rename = "DONE")]
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msgid: Option<u64>,
    },
    #[serde(rename = "ACKDONE")]
    AckDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },
    #[serde(rename = "BYE")]
    Bye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ---- failure surfaces ----
    #[serde(rename = "FAIL")]
    Fail {
        status: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respid: Option<u64>,
    },
    #[serde(rename = "AUTHFAIL")]
    AuthFail { status: String, error: String },
}

impl Msg {
    /// Wire tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Msg::Backup { .. } => "BACKUP",
            Msg::NeedKeys {} => "NEEDKEYS",
            Msg::SetKeys { .. } => "SETKEYS",
            Msg::AckSetKeys { .. } => "ACKSETKEYS",
            Msg::AuthChallenge { .. } => "AUTH",
            Msg::Auth1 { .. } => "AUTH1",
            Msg::Auth1Ok { .. } => "AUTH1-OK",
            Msg::Auth2 { .. } => "AUTH2",
            Msg::Auth2Ok { .. } => "AUTH2-OK",
            Msg::Init { .. } => "INIT",
            Msg::Dir { .. } => "DIR",
            Msg::AckDir { .. } => "ACKDIR",
            Msg::DirHash { .. } => "DHSH",
            Msg::AckDirHash { .. } => "ACKDHSH",
            Msg::SigRequest { .. } => "SGR",
            Msg::SigsRequest { .. } => "SGS",
            Msg::Sig { .. } => "SIG",
            Msg::Delta { .. } => "DEL",
            Msg::Content { .. } => "CON",
            Msg::Checksums { .. } => "CKS",
            Msg::AckSum { .. } => "ACKSUM",
            Msg::Clone { .. } => "CLN",
            Msg::AckClone { .. } => "ACKCLN",
            Msg::Meta { .. } => "META",
            Msg::AckMeta { .. } => "ACKMETA",
            Msg::MetaData { .. } => "METADATA",
            Msg::Batch { .. } => "BATCH",
            Msg::AckBatch { .. } => "ACKBTCH",
            Msg::Purge { .. } => "PRG",
            Msg::AckPurge { .. } => "ACKPRG",
            Msg::ClientConfig { .. } => "CLICONFIG",
            Msg::AckClientConfig { .. } => "ACKCLICONFIG",
            Msg::CommandLine { .. } => "COMMANDLINE",
            Msg::AckCommandLine { .. } => "ACKCMDLN",
            Msg::Done { .. } => "DONE",
            Msg::AckDone { .. } => "ACKDONE",
            Msg::Bye { .. } => "BYE",
            Msg::Fail { .. } => "FAIL",
            Msg::AuthFail { .. } => "AUTHFAIL",
        }
    }

    /// The request id, if this variant carries one.
    pub fn msgid(&self) -> Option<u64> {
        match self {
            Msg::SetKeys { msgid, .. }
            | Msg::Dir { msgid, .. }
            | Msg::DirHash { msgid, .. }
            | Msg::SigRequest { msgid, .. }
            | Msg::SigsRequest { msgid, .. }
            | Msg::Checksums { msgid, .. }
            | Msg::Clone { msgid, .. }
            | Msg::Meta { msgid, .. }
            | Msg::Batch { msgid, .. }
            | Msg::Purge { msgid, .. }
            | Msg::ClientConfig { msgid, .. }
            | Msg::CommandLine { msgid, .. }
            | Msg::Done { msgid, .. } => *msgid,
            _ => None,
        }
    }

    /// Stamp a fresh request id onto this message.
    pub fn set_msgid(&mut self, id: u64) {
        match self {
            Msg::SetKeys { msgid, .. }
            | Msg::Dir { msgid, .. }
            | Msg::DirHash { msgid, .. }
            | Msg::SigRequest { msgid, .. }
            | Msg::SigsRequest { msgid, .. }
            | Msg::Checksums { msgid, .. }
            | Msg::Clone { msgid, .. }
            | Msg::Meta { msgid, .. }
            | Msg::Batch { msgid, .. }
            | Msg::Purge { msgid, .. }
            | Msg::ClientConfig { msgid, .. }
            | Msg::CommandLine { msgid, .. }
            | Msg::Done { msgid, .. } => *msgid = Some(id),
            _ => {}
        }
    }

    /// Echo a request id into this response's `respid`.
    pub fn set_respid(&mut self, id: u64) {
        match self {
            Msg::AckSetKeys { respid, .. }
            | Msg::AckDir { respid, .. }
            | Msg::AckDirHash { respid, .. }
            | Msg::Sig { respid, .. }
            | Msg::AckSum { respid, .. }
            | Msg::AckClone { respid, .. }
            | Msg::AckMeta { respid, .. }
            | Msg::AckBatch { respid, .. }
            | Msg::AckPurge { respid, .. }
            | Msg::AckClientConfig { respid, .. }
            | Msg::AckCommandLine { respid, .. }
            | Msg::AckDone { respid, .. }
            | Msg::Fail { respid, .. } => *respid = Some(id),
            _ => {}
        }
    }

    /// Build a FAIL response.
    pub fn fail(error: impl Into<String>) -> Msg {
        Msg::Fail { status: "FAIL".into(), error: error.into(), respid: None }
    }

    /// Build an AUTHFAIL response.
    pub fn auth_fail(error: impl Into<String>) -> Msg {
        Msg::AuthFail { status: "AUTHFAIL".into(), error: error.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_round_trip_json() {
        let m = Msg::Dir {
            path: "/E1/E2".into(),
            inode: (10, 20),
            files: vec![],
            last: true,
            msgid: Some(7),
        };
        let s = serde_json::to_string(&m).unwrap();
        assert!(s.contains("\"message\":\"DIR\""));
        let back: Msg = serde_json::from_str(&s).unwrap();
        assert_eq!(back.tag(), "DIR");
        assert_eq!(back.msgid(), Some(7));
    }

    #[test]
    fn optional_fields_absent_on_wire() {
        let m = Msg::Content { inode: (1, 2), checksum: None, encrypted: false };
        let s = serde_json::to_string(&m).unwrap();
        assert!(!s.contains("checksum"));
    }

    #[test]
    fn respid_echo() {
        let mut m = Msg::AckDone { respid: None };
        m.set_respid(42);
        match m {
            Msg::AckDone { respid } => assert_eq!(respid, Some(42)),
            _ => unreachable!(),
        }
    }
}
