//! Work messages drained by partition executors.
//!
//! Two ingress variants exist: `Initiate` starts a stored procedure at a
//! transaction's base partition, `Fragment` executes plan fragments on
//! behalf of a transaction whose procedure may run elsewhere. `Prepare` and
//! `Finish` carry the commit protocol onto the owning executor thread so
//! the storage engine is never touched from outside it, and `Poison` wakes
//! the loop for shutdown.

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::{ClientHandle, DependencyId, FragmentId, PartitionId, TxnId};

use crate::table::{Table, Value};

/// Request to start a stored procedure at the transaction's base partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateTask {
    /// Transaction id minted by the coordinator.
    pub txn_id: TxnId,
    /// Partition the procedure body executes on.
    pub base_partition: PartitionId,
    /// Client handle echoed in the response.
    pub client_handle: ClientHandle,
    /// Partition the request entered the site through.
    pub source_partition: PartitionId,
    /// Registered procedure name.
    pub proc_name: String,
    /// Decoded invocation parameters.
    pub params: Vec<Value>,
    /// Partitions the planner predicts this transaction touches.
    pub predict_partitions: Vec<PartitionId>,
    /// Whether the planner predicts a read-only transaction.
    pub predict_read_only: bool,
    /// Whether the planner predicts the procedure can abort.
    pub predict_abortable: bool,
}

impl InitiateTask {
    /// Returns whether the prediction is single-partition: the predicted
    /// set is exactly the base partition.
    #[must_use]
    pub fn predicts_single_partition(&self) -> bool {
        self.predict_partitions == [self.base_partition]
    }
}

/// Request to execute an ordered batch of plan fragments on one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentTask {
    /// Transaction the fragments belong to.
    pub txn_id: TxnId,
    /// Partition that issued the batch (the transaction's base partition).
    pub source_partition: PartitionId,
    /// Partition that must execute the batch.
    pub destination_partition: PartitionId,
    /// Compiled fragment ids, in execution order.
    pub fragment_ids: Vec<FragmentId>,
    /// Encoded parameter buffer per fragment, parallel to `fragment_ids`.
    /// Executors re-decode into owned values: the transport may reclaim
    /// these buffers after dispatch.
    pub param_blobs: Vec<Vec<u8>>,
    /// Input dependency ids the batch consumes (unordered).
    pub input_dep_ids: Vec<DependencyId>,
    /// Output dependency ids the batch produces, parallel to `fragment_ids`.
    pub output_dep_ids: Vec<DependencyId>,
    /// Whether the task was delivered through the coordinator path.
    pub via_coordinator: bool,
    /// Whether the fragments route to a registered system procedure.
    pub sysproc: bool,
    /// Input rows attached inline so the destination has all its inputs.
    pub attached_deps: Vec<(DependencyId, Table)>,
}

impl FragmentTask {
    /// Number of fragments in the batch.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragment_ids.len()
    }

    /// Returns whether the batch executes on the issuing partition itself.
    #[must_use]
    pub fn is_local_to(&self, partition: PartitionId) -> bool {
        self.destination_partition == partition
    }

    /// Returns whether the batch declares any input dependencies.
    #[must_use]
    pub fn has_input_dependencies(&self) -> bool {
        !self.input_dep_ids.is_empty()
    }

    /// Attaches rows for one input dependency so the destination partition
    /// does not have to fetch them.
    pub fn attach_result(&mut self, dep_id: DependencyId, table: Table) {
        self.attached_deps.push((dep_id, table));
    }
}

/// Unit of work drained by one partition executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// Start a stored procedure.
    Initiate(InitiateTask),
    /// Execute plan fragments.
    Fragment(FragmentTask),
    /// Report whether the partition is ready to commit the transaction.
    Prepare {
        /// Transaction being prepared.
        txn_id: TxnId,
    },
    /// Conclude the transaction on this partition.
    Finish {
        /// Transaction being concluded.
        txn_id: TxnId,
        /// `true` commits, `false` rolls back.
        commit: bool,
    },
    /// Wakes the loop so a shutdown flag is observed promptly.
    Poison,
}

const PARAM_TAG_NULL: u8 = 0;
const PARAM_TAG_INTEGER: u8 = 1;
const PARAM_TAG_DOUBLE: u8 = 2;
const PARAM_TAG_TEXT: u8 = 3;

/// Encodes a parameter set into the length-prefixed buffer carried by
/// [`FragmentTask::param_blobs`].
#[must_use]
pub fn encode_params(params: &[Value]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(4 + params.len() * 9);
    buffer.extend_from_slice(&u32::try_from(params.len()).unwrap_or(u32::MAX).to_le_bytes());
    for value in params {
        match value {
            Value::Null => buffer.push(PARAM_TAG_NULL),
            Value::Integer(inner) => {
                buffer.push(PARAM_TAG_INTEGER);
                buffer.extend_from_slice(&inner.to_le_bytes());
            }
            Value::Double(inner) => {
                buffer.push(PARAM_TAG_DOUBLE);
                buffer.extend_from_slice(&inner.to_bits().to_le_bytes());
            }
            Value::Text(inner) => {
                buffer.push(PARAM_TAG_TEXT);
                let bytes = inner.as_bytes();
                buffer.extend_from_slice(
                    &u32::try_from(bytes.len()).unwrap_or(u32::MAX).to_le_bytes(),
                );
                buffer.extend_from_slice(bytes);
            }
        }
    }
    buffer
}

/// Decodes a parameter buffer back into owned values.
///
/// # Errors
///
/// Returns [`KilnError::Deserialize`] when the buffer is truncated, carries
/// an unknown tag, or holds non-UTF-8 text.
pub fn decode_params(buffer: &[u8]) -> KilnResult<Vec<Value>> {
    let mut cursor = Cursor { buffer, offset: 0 };
    let count = cursor.read_u32()? as usize;
    let mut params = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = cursor.read_u8()?;
        let value = match tag {
            PARAM_TAG_NULL => Value::Null,
            PARAM_TAG_INTEGER => Value::Integer(i64::from_le_bytes(cursor.read_array()?)),
            PARAM_TAG_DOUBLE => Value::Double(f64::from_bits(u64::from_le_bytes(
                cursor.read_array()?,
            ))),
            PARAM_TAG_TEXT => {
                let len = cursor.read_u32()? as usize;
                let bytes = cursor.read_slice(len)?;
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    KilnError::Deserialize("text parameter is not valid UTF-8".to_owned())
                })?;
                Value::Text(text.to_owned())
            }
            other => {
                return Err(KilnError::Deserialize(format!(
                    "unknown parameter tag {other}"
                )));
            }
        };
        params.push(value);
    }
    if cursor.offset != buffer.len() {
        return Err(KilnError::Deserialize(
            "trailing bytes after last parameter".to_owned(),
        ));
    }
    Ok(params)
}

struct Cursor<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl Cursor<'_> {
    fn read_slice(&mut self, len: usize) -> KilnResult<&[u8]> {
        let end = self.offset.checked_add(len).ok_or_else(|| {
            KilnError::Deserialize("parameter length overflows buffer".to_owned())
        })?;
        let Some(slice) = self.buffer.get(self.offset..end) else {
            return Err(KilnError::Deserialize(
                "parameter buffer is truncated".to_owned(),
            ));
        };
        self.offset = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> KilnResult<[u8; N]> {
        let slice = self.read_slice(N)?;
        let mut array = [0_u8; N];
        array.copy_from_slice(slice);
        Ok(array)
    }

    fn read_u8(&mut self) -> KilnResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_u32(&mut self) -> KilnResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }
}
