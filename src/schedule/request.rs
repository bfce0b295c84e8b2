use crate::encoding::wire::{self, Wire};
use crate::error::{Error, Result};
use crate::{Epoch, Index, JobId, Rank, Revision};

use serde_derive::{Deserialize, Serialize};

/// The application backend a job runs on. The scheduler treats applications
/// uniformly through the `app::Application` trait and never inspects them;
/// the kind only selects the factory when a job is first instantiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum AppKind {
    /// The built-in demo solver, which "solves" after a payload-defined
    /// delay. Used by mono deployments and tests.
    Demo = 0,
}

impl AppKind {
    pub fn from_wire(value: i32) -> Result<AppKind> {
        match value {
            0 => Ok(AppKind::Demo),
            _ => Err(Error::BadRequest(format!("unknown application {value}"))),
        }
    }
}

/// A request for one node of a job's tree, bounced across the fleet until a
/// worker adopts it.
///
/// Two requests are considered equal when they agree on job, index, epoch,
/// revision, and hop count; use [`JobRequest::matches_commitment`] to compare
/// against a stored commitment, which additionally ignores the hop count and
/// the requesting rank (a re-spawned request for the same slot supersedes the
/// older one).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub application: AppKind,
    /// The rank of the job's root node.
    pub root_rank: Rank,
    /// The node that spawned this request and awaits the adoption offer.
    pub requesting_rank: Rank,
    /// The tree index to be filled.
    pub requested_index: Index,
    /// The revision the adopter must eventually reach.
    pub current_revision: Revision,
    /// The newest revision the requester knows the adoptee to have.
    pub last_known_revision: Revision,
    /// Time the request was spawned, in seconds since worker startup.
    pub time_of_birth: f32,
    /// Bounces so far. -1 marks a oneshot request falling back to normal
    /// hopping, so the next bounce re-enters at hop 0.
    pub num_hops: i32,
    /// The balancing epoch this request was spawned under.
    pub balancing_epoch: Epoch,
}

impl JobRequest {
    /// Whether this request targets the same slot as a stored commitment,
    /// ignoring hop count and requesting rank.
    pub fn matches_commitment(&self, other: &JobRequest) -> bool {
        self.job_id == other.job_id
            && self.requested_index == other.requested_index
            && self.balancing_epoch == other.balancing_epoch
            && self.current_revision == other.current_revision
    }
}

impl PartialEq for JobRequest {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
            && self.requested_index == other.requested_index
            && self.balancing_epoch == other.balancing_epoch
            && self.current_revision == other.current_revision
            && self.num_hops == other.num_hops
    }
}

impl Eq for JobRequest {}

impl PartialOrd for JobRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobRequest {
    /// Request order: epoch first, then job, index, revision, and hops.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.balancing_epoch, self.job_id, self.requested_index, self.current_revision, self.num_hops)
            .cmp(&(
                other.balancing_epoch,
                other.job_id,
                other.requested_index,
                other.current_revision,
                other.num_hops,
            ))
    }
}

impl std::fmt::Display for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "r.#{}:{} rev. {} <- [{}] born={:.3} hops={} epoch={}",
            self.job_id,
            self.requested_index,
            self.current_revision,
            self.requesting_rank,
            self.time_of_birth,
            self.num_hops,
            self.balancing_epoch
        )
    }
}

impl Wire for JobRequest {
    fn encode(&self, buf: &mut Vec<u8>) {
        wire::put_u32(buf, self.job_id);
        wire::put_i32(buf, self.application as i32);
        wire::put_u32(buf, self.root_rank);
        wire::put_u32(buf, self.requesting_rank);
        wire::put_u32(buf, self.requested_index);
        wire::put_i32(buf, self.current_revision);
        wire::put_i32(buf, self.last_known_revision);
        wire::put_f32(buf, self.time_of_birth);
        wire::put_i32(buf, self.num_hops);
        wire::put_i32(buf, self.balancing_epoch);
    }

    fn decode(buf: &[u8], offset: &mut usize) -> Result<Self> {
        Ok(Self {
            job_id: wire::get_u32(buf, offset)?,
            application: AppKind::from_wire(wire::get_i32(buf, offset)?)?,
            root_rank: wire::get_u32(buf, offset)?,
            requesting_rank: wire::get_u32(buf, offset)?,
            requested_index: wire::get_u32(buf, offset)?,
            current_revision: wire::get_i32(buf, offset)?,
            last_known_revision: wire::get_i32(buf, offset)?,
            time_of_birth: wire::get_f32(buf, offset)?,
            num_hops: wire::get_i32(buf, offset)?,
            balancing_epoch: wire::get_i32(buf, offset)?,
        })
    }
}

/// A dormant child's answer to a oneshot request it will not serve. The flag
/// tells the requester whether the child still holds a dormant copy, i.e.
/// whether it remains worth asking again later.
#[derive(Clone, Debug, PartialEq)]
pub struct OneshotRejection {
    pub request: JobRequest,
    pub is_child_still_dormant: bool,
}

impl Wire for OneshotRejection {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.request.encode(buf);
        wire::put_bool(buf, self.is_child_still_dormant);
    }

    fn decode(buf: &[u8], offset: &mut usize) -> Result<Self> {
        Ok(Self {
            request: JobRequest::decode(buf, offset)?,
            is_child_still_dormant: wire::get_bool(buf, offset)?,
        })
    }
}

/// An application-level message between nodes of a job tree, opaque to the
/// scheduler except for routing metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct JobMessage {
    pub job_id: JobId,
    pub revision: Revision,
    /// An application-defined message tag.
    pub tag: i32,
    pub epoch: Epoch,
    pub checksum: u64,
    pub payload: Vec<i32>,
}

impl JobMessage {
    /// An FNV-1a digest over the payload words.
    pub fn digest(payload: &[i32]) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for &word in payload {
            for byte in word.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == Self::digest(&self.payload)
    }
}

impl Wire for JobMessage {
    fn encode(&self, buf: &mut Vec<u8>) {
        wire::put_u32(buf, self.job_id);
        wire::put_i32(buf, self.revision);
        wire::put_i32(buf, self.tag);
        wire::put_i32(buf, self.epoch);
        wire::put_u64(buf, self.checksum);
        for &word in &self.payload {
            wire::put_i32(buf, word);
        }
    }

    fn decode(buf: &[u8], offset: &mut usize) -> Result<Self> {
        let job_id = wire::get_u32(buf, offset)?;
        let revision = wire::get_i32(buf, offset)?;
        let tag = wire::get_i32(buf, offset)?;
        let epoch = wire::get_i32(buf, offset)?;
        let checksum = wire::get_u64(buf, offset)?;
        let payload = wire::decode_i32s(&buf[*offset..], 0)?;
        *offset = buf.len();
        Ok(Self { job_id, revision, tag, epoch, checksum, payload })
    }
}

/// One revision of a job's description. The first revision carries the job's
/// configuration; later revisions of an incremental job extend the payload.
/// Descriptions travel as bincode, revision by revision, from parent to
/// child.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub job_id: JobId,
    pub application: AppKind,
    pub client_rank: Rank,
    pub priority: f32,
    pub incremental: bool,
    /// Wallclock budget in seconds, enforced at the root. 0 disables.
    pub wallclock_limit: f64,
    /// CPU-seconds budget across the whole tree. 0 disables.
    pub cpu_limit: f64,
    pub revision: Revision,
    pub payload: Vec<i32>,
}

impl JobDescription {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        crate::encoding::bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        crate::encoding::bincode::deserialize(bytes)
    }
}

/// The outcome of a solved job, stored at the node that found it and
/// transferred to the client on request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub revision: Revision,
    pub result_code: i32,
    pub solution: Vec<i32>,
}

/// Statistics sent to the client when a job completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub job_id: JobId,
    pub successful_rank: Rank,
    pub used_wallclock_seconds: f64,
    pub used_cpu_seconds: f64,
    pub latency_of_first_volume_update: f64,
}
