//! Everything nodes say to each other.
//!
//! Messages travel through the lamellae inside an [Envelope] naming the sender. Requests that expect an
//! answer carry a `request` id allocated by the sender; the matching response variant carries it back
//! and is turned into a [ReplyPayload] for whoever awaits it.

use crate::collective_mapping::CollectiveMapping;
use crate::copy::{FieldBuffer, ReductionOpKind};
use crate::domain::{Domain, DomainPoint};
use crate::event::EventToken;
use crate::instance::{
    AllReduceTag, DistributedId, GcDebugInfo, GcPriority, InstanceKind, MapperId, PointLocation,
    ProcessorId, RendezvousKey, TopViewKey,
};
use crate::layout::{FieldId, FieldMask, FieldSpace, LayoutConstraintSet};
use crate::memory::{MemoryId, PhysicalInstance};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub(crate) src: usize,
    pub(crate) msg: InstanceMessage,
}

/// Where a broadcast takes its data from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum BroadcastSource {
    /// a point instance living on the origin of the broadcast
    Point(DomainPoint),
    Buffer(FieldBuffer),
}

/// Where the result of a tree reduction goes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum ReductionTarget {
    /// fold the subtree and reply to the parent
    Parent { request: u64 },
    /// the receiver roots the tree and writes the result into `point`
    Point { point: DomainPoint, done: EventToken },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum DescriptorVariant {
    Individual {
        memory: MemoryId,
        instance: Option<PhysicalInstance>,
        kind: InstanceKind,
    },
    Collective {
        point_space: Domain,
        mapping: CollectiveMapping,
        multi_instance: bool,
        redop: Option<ReductionOpKind>,
    },
}

/// Enough metadata to rebuild a physical manager on another node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ManagerDescriptor {
    pub(crate) did: DistributedId,
    pub(crate) field_space: FieldSpace,
    pub(crate) constraints: LayoutConstraintSet,
    pub(crate) tree_id: u32,
    pub(crate) instance_domain: Domain,
    pub(crate) footprint: usize,
    pub(crate) variant: DescriptorVariant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum InstanceMessage {
    // garbage collection
    GcRequest {
        did: DistributedId,
        epoch: u64,
    },
    GcResponse {
        did: DistributedId,
        epoch: u64,
        accepted: bool,
    },
    GcFailed {
        did: DistributedId,
        epoch: u64,
    },
    GcAcquireRequest {
        did: DistributedId,
        request: u64,
    },
    GcAcquireResponse {
        request: u64,
        acquired: bool,
    },
    GcPriorityUpdate {
        did: DistributedId,
        mapper: MapperId,
        processor: ProcessorId,
        priority: GcPriority,
    },
    GcDebugRequest {
        did: DistributedId,
        request: u64,
    },
    GcDebugResponse {
        request: u64,
        info: GcDebugInfo,
    },
    ManagerDeletion {
        did: DistributedId,
    },

    // manager distribution
    ManagerRequest {
        did: DistributedId,
        target: usize,
    },
    SendManager {
        descriptor: ManagerDescriptor,
    },
    ManagerMissing {
        did: DistributedId,
    },
    ManagerUpdate {
        did: DistributedId,
        instance: PhysicalInstance,
        kind: InstanceKind,
    },
    /// the receiver named an object it does not know; fails the request instead of answering it
    RequestFailed {
        request: u64,
    },

    // views
    TopViewRequest {
        did: DistributedId,
        key: TopViewKey,
        request: u64,
    },
    TopViewResponse {
        request: u64,
        view: DistributedId,
    },
    TopViewCreation {
        view: DistributedId,
        manager: DistributedId,
        creator: usize,
    },

    // collective users
    RegisterUserRequest {
        did: DistributedId,
        key: RendezvousKey,
        usage: FieldMask,
        term: EventToken,
    },
    RegisterUserResponse {
        did: DistributedId,
        key: RendezvousKey,
    },
    RemoteRegistration {
        did: DistributedId,
        key: RendezvousKey,
        usage: FieldMask,
        term: EventToken,
        ready: EventToken,
    },
    TriggerEvent {
        token: EventToken,
    },

    // collective point discovery
    InstanceCreation {
        did: DistributedId,
        point: DomainPoint,
        location: Option<PointLocation>,
    },
    PointRequest {
        did: DistributedId,
        point: DomainPoint,
        request: u64,
    },
    PointResponse {
        request: u64,
        location: Option<PointLocation>,
    },
    FindPointsRequest {
        did: DistributedId,
        memory: MemoryId,
        request: u64,
    },
    NearestPointsRequest {
        did: DistributedId,
        memory: MemoryId,
        request: u64,
    },
    PointsResponse {
        request: u64,
        points: Vec<DomainPoint>,
    },

    // collective data movement
    DistributeFill {
        did: DistributedId,
        origin: usize,
        fields: Vec<FieldId>,
        value: ByteBuf,
        done: EventToken,
    },
    DistributeBroadcast {
        did: DistributedId,
        origin: usize,
        fields: Vec<FieldId>,
        source: BroadcastSource,
        done: EventToken,
    },
    DistributeReducecast {
        did: DistributedId,
        origin: usize,
        redop: ReductionOpKind,
        buffer: FieldBuffer,
        done: EventToken,
    },
    DistributeReduction {
        did: DistributedId,
        origin: usize,
        fields: Vec<FieldId>,
        redop: ReductionOpKind,
        target: ReductionTarget,
    },
    ReductionPartial {
        request: u64,
        buffer: Option<FieldBuffer>,
    },
    DistributeHourglass {
        did: DistributedId,
        dst: DistributedId,
        fields: Vec<FieldId>,
        redop: ReductionOpKind,
        done: EventToken,
    },
    DistributePointwise {
        did: DistributedId,
        origin: usize,
        src: DistributedId,
        fields: Vec<FieldId>,
        done: EventToken,
    },
    DistributePoint {
        did: DistributedId,
        point: DomainPoint,
        fields: Vec<FieldId>,
        request: u64,
    },
    DistributePointResponse {
        request: u64,
        buffer: Option<FieldBuffer>,
    },
    DistributeAllreduce {
        did: DistributedId,
        tag: AllReduceTag,
        run: u64,
        stage: u32,
        buffer: FieldBuffer,
    },
    HammerReduction {
        did: DistributedId,
        tag: AllReduceTag,
        run: u64,
        buffer: FieldBuffer,
    },
}

impl InstanceMessage {
    /// The request id and payload if this message answers an earlier request
    pub(crate) fn into_reply(self) -> Result<(u64, ReplyPayload), InstanceMessage> {
        match self {
            InstanceMessage::GcAcquireResponse { request, acquired } => {
                Ok((request, ReplyPayload::Bool(acquired)))
            }
            InstanceMessage::GcDebugResponse { request, info } => {
                Ok((request, ReplyPayload::Debug(info)))
            }
            InstanceMessage::TopViewResponse { request, view } => {
                Ok((request, ReplyPayload::Did(view)))
            }
            InstanceMessage::PointResponse { request, location } => {
                Ok((request, ReplyPayload::Point(location)))
            }
            InstanceMessage::PointsResponse { request, points } => {
                Ok((request, ReplyPayload::Points(points)))
            }
            InstanceMessage::ReductionPartial { request, buffer }
            | InstanceMessage::DistributePointResponse { request, buffer } => {
                Ok((request, ReplyPayload::Buffer(buffer)))
            }
            other => Err(other),
        }
    }
}

/// The answer to a request, as delivered to the awaiting task
#[derive(Debug, Clone)]
pub(crate) enum ReplyPayload {
    Bool(bool),
    Did(DistributedId),
    Debug(GcDebugInfo),
    Buffer(Option<FieldBuffer>),
    Point(Option<PointLocation>),
    Points(Vec<DomainPoint>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_survives_the_wire() {
        let did = DistributedId::virtual_manager(3);
        let envelope = Envelope {
            src: 1,
            msg: InstanceMessage::DistributeFill {
                did,
                origin: 2,
                fields: vec![10, 11],
                value: ByteBuf::from(vec![1, 2, 3, 4]),
                done: EventToken { node: 1, id: 7 },
            },
        };
        let bytes = crate::serialize(&envelope).unwrap();
        let back: Envelope = crate::deserialize(&bytes).unwrap();
        assert_eq!(back.src, 1);
        match back.msg {
            InstanceMessage::DistributeFill {
                did: d,
                origin,
                fields,
                value,
                done,
            } => {
                assert_eq!(d, did);
                assert_eq!(origin, 2);
                assert_eq!(fields, vec![10, 11]);
                assert_eq!(value.into_vec(), vec![1, 2, 3, 4]);
                assert_eq!(done.id, 7);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn responses_become_replies() {
        let (request, payload) = InstanceMessage::GcAcquireResponse {
            request: 9,
            acquired: true,
        }
        .into_reply()
        .unwrap();
        assert_eq!(request, 9);
        assert!(matches!(payload, ReplyPayload::Bool(true)));
        assert!(InstanceMessage::TriggerEvent {
            token: EventToken { node: 0, id: 1 }
        }
        .into_reply()
        .is_err());
    }
}
