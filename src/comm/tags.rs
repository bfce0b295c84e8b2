/// Message tags. Values are stable wire integers; batched fragments of a
/// large message are sent with the tag shifted by [`OFFSET_BATCHED`], so the
/// two ranges must stay disjoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Tag {
    /// A job request looking for an adopter, bounced across the fleet.
    RequestNode = 1,
    /// A job request sent directly to a dormant child (targeted rejoin).
    RequestNodeOneshot = 2,
    /// A dormant child declining a oneshot request.
    RejectOneshot = 3,
    /// A committed adoptee offering itself to the requesting node.
    OfferAdoption = 4,
    /// A committed adoptee offering a root to the client.
    OfferAdoptionOfRoot = 5,
    /// The requester accepting or declining an adoption offer.
    AnswerAdoptionOffer = 6,
    /// A child asking its parent for a description revision.
    QueryJobDescription = 7,
    /// A serialized description revision.
    SendJobDescription = 8,
    /// A child asking its parent for the current volume of a job.
    QueryVolume = 9,
    /// A volume assignment propagated down a tree edge.
    NotifyVolumeUpdate = 10,
    /// A node informing its parent (or the root) that it left the job tree.
    NotifyNodeLeavingJob = 11,
    /// Graceful termination, propagated down the tree and to past children.
    NotifyJobTerminating = 12,
    /// Interruption (suspend), propagated down the tree.
    Interrupt = 13,
    /// Reckless termination, propagated down the tree and to past children.
    NotifyJobAborting = 14,
    /// A client finishing an incremental job.
    IncrementalJobFinished = 15,
    /// A node reporting a result to the job's root.
    NotifyResultFound = 16,
    /// The root telling a finder that its result is no longer wanted.
    NotifyResultObsolete = 17,
    /// A client requesting the full result from the successful node.
    QueryJobResult = 18,
    /// The full serialized job result.
    SendJobResult = 19,
    /// The root notifying the client of completion, with statistics.
    NotifyJobDone = 20,
    /// The root forwarding an abort notice to the client.
    NotifyClientJobAborting = 21,
    /// An application-level message between job tree nodes.
    ApplicationMessage = 22,
    /// A system-state contribution travelling up the reduction tree.
    ReduceData = 23,
    /// The aggregated system state travelling down the reduction tree.
    BroadcastData = 24,
    /// A request to begin process shutdown (mono mode).
    DoExit = 25,
    /// A scratch message warming up transport links at startup.
    Warmup = 26,
}

/// Tag offset marking a fragment of a batched large message. The fragment
/// carries the original tag plus this offset, and a trailer identifying its
/// position within the transfer.
pub const OFFSET_BATCHED: u32 = 100;

impl Tag {
    pub fn from_wire(value: u32) -> Option<Tag> {
        use Tag::*;
        Some(match value {
            1 => RequestNode,
            2 => RequestNodeOneshot,
            3 => RejectOneshot,
            4 => OfferAdoption,
            5 => OfferAdoptionOfRoot,
            6 => AnswerAdoptionOffer,
            7 => QueryJobDescription,
            8 => SendJobDescription,
            9 => QueryVolume,
            10 => NotifyVolumeUpdate,
            11 => NotifyNodeLeavingJob,
            12 => NotifyJobTerminating,
            13 => Interrupt,
            14 => NotifyJobAborting,
            15 => IncrementalJobFinished,
            16 => NotifyResultFound,
            17 => NotifyResultObsolete,
            18 => QueryJobResult,
            19 => SendJobResult,
            20 => NotifyJobDone,
            21 => NotifyClientJobAborting,
            22 => ApplicationMessage,
            23 => ReduceData,
            24 => BroadcastData,
            25 => DoExit,
            26 => Warmup,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for value in 1..=26 {
            let tag = Tag::from_wire(value).unwrap();
            assert_eq!(tag.to_wire(), value);
        }
        assert_eq!(Tag::from_wire(0), None);
        assert_eq!(Tag::from_wire(27), None);
        // The batched range must not collide with plain tags.
        assert_eq!(Tag::from_wire(OFFSET_BATCHED), None);
    }
}
