use crate::collective_mapping::NotMemberError;
use crate::domain::DomainPoint;
use crate::instance::{DistributedId, GcDebugInfo, GcState, RendezvousKey};
use crate::layout::{FieldId, FieldSpaceId, LayoutConstraintKind};
use crate::memory::MemoryId;

/// Errors reported by instance construction, the garbage collector and collective operations
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceError {
    /// The requested layout constraints cannot be met on the target memory
    LayoutUnsatisfiable {
        kind: LayoutConstraintKind,
        field_index: Option<usize>,
    },
    /// The memory could not reserve the requested footprint
    AllocationFailed { memory: MemoryId, footprint: usize },
    /// The operation targets an instance in a state that does not allow it
    InvalidInstanceState {
        did: DistributedId,
        state: GcState,
        operation: &'static str,
    },
    /// A remote holder re-acquired the instance while a collection was pending
    GcRaceRefused { did: DistributedId },
    /// Arrivals for a rendezvous disagree with the declared counts
    RendezvousMismatch {
        key: RendezvousKey,
        expected_local: usize,
        expected_remote: usize,
        local: usize,
        remote: usize,
    },
    UnknownManager(DistributedId),
    UnknownMemory(MemoryId),
    UnknownFieldSpace(FieldSpaceId),
    UnknownField(FieldId),
    PointNotFound {
        did: DistributedId,
        point: DomainPoint,
    },
    NotMember(NotMemberError),
    /// A message could not be encoded, delivered or answered
    Transport(String),
}

pub type InstanceResult<T> = Result<T, InstanceError>;

impl std::fmt::Display for InstanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InstanceError::LayoutUnsatisfiable { kind, field_index } => match field_index {
                Some(idx) => write!(f, "layout constraint {:?} unsatisfiable for field index {}", kind, idx),
                None => write!(f, "layout constraint {:?} unsatisfiable", kind),
            },
            InstanceError::AllocationFailed { memory, footprint } => {
                write!(f, "unable to allocate {} bytes in memory {}", footprint, memory)
            }
            InstanceError::InvalidInstanceState {
                did,
                state,
                operation,
            } => write!(f, "{} not permitted on instance {} in state {:?}", operation, did, state),
            InstanceError::GcRaceRefused { did } => {
                write!(f, "collection of {} refused, instance was re-acquired", did)
            }
            InstanceError::RendezvousMismatch {
                key,
                expected_local,
                expected_remote,
                local,
                remote,
            } => write!(
                f,
                "rendezvous {:?} expected {} local and {} remote arrivals, saw {} local and {} remote",
                key, expected_local, expected_remote, local, remote
            ),
            InstanceError::UnknownManager(did) => write!(f, "no manager for {}", did),
            InstanceError::UnknownMemory(memory) => write!(f, "no local memory {}", memory),
            InstanceError::UnknownFieldSpace(fs) => write!(f, "no field space {}", fs),
            InstanceError::UnknownField(fid) => write!(f, "no field {}", fid),
            InstanceError::PointNotFound { did, point } => {
                write!(f, "point {:?} is not backed by collective instance {}", point, did)
            }
            InstanceError::NotMember(err) => write!(f, "{}", err),
            InstanceError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for InstanceError {}

impl From<NotMemberError> for InstanceError {
    fn from(err: NotMemberError) -> Self {
        InstanceError::NotMember(err)
    }
}

impl From<anyhow::Error> for InstanceError {
    fn from(err: anyhow::Error) -> Self {
        InstanceError::Transport(err.to_string())
    }
}

impl From<futures::channel::oneshot::Canceled> for InstanceError {
    fn from(_: futures::channel::oneshot::Canceled) -> Self {
        InstanceError::Transport("reply channel closed before a response arrived".to_owned())
    }
}

/// Terminates on a distributed protocol violation after dumping the local state of the instance.
#[track_caller]
pub(crate) fn fatal(err: InstanceError, dump: Option<GcDebugInfo>) -> ! {
    match dump {
        Some(dump) => tracing::error!(error = %err, ?dump, "instance protocol violation"),
        None => tracing::error!(error = %err, "instance protocol violation"),
    }
    panic!("instance protocol violation: {}", err);
}
