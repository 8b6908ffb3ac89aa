use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

use crate::Address;

/// Interned instruction payload. All instructions with the same mnemonic and
/// operand text share a single allocation, so instructions from the two
/// programs of a diff session compare by pointer identity.
#[derive(Debug)]
pub struct InstructionData {
    pub mnemonic: String,
    pub operands: String,
}

/// A single disassembled instruction: a code location plus a handle into the
/// shared instruction cache. The call target is a per-site attribute and is
/// not part of the interned payload.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: Address,
    pub call_target: Option<Address>,
    data: Arc<InstructionData>,
}

impl Instruction {
    pub fn mnemonic(&self) -> &str {
        &self.data.mnemonic
    }

    pub fn operands(&self) -> &str {
        &self.data.operands
    }

    /// Identity comparison through the shared cache.
    pub fn same_as(&self, other: &Instruction) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub fn is_call(&self) -> bool {
        self.call_target.is_some()
    }
}

/// Session-wide instruction cache. Mutated only while graphs are being
/// constructed; read-only during matching. Cleared on session teardown.
#[derive(Clone, Default)]
pub struct InstructionCache {
    interned: Arc<RwLock<FxHashMap<u128, Arc<InstructionData>>>>,
}

impl InstructionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(
        &self,
        address: Address,
        mnemonic: &str,
        operands: &str,
        call_target: Option<Address>,
    ) -> Instruction {
        let key = intern_key(mnemonic, operands);
        if let Some(data) = self.interned.read().get(&key) {
            return Instruction {
                address,
                call_target,
                data: Arc::clone(data),
            };
        }

        let mut interned = self.interned.write();
        let data = Arc::clone(interned.entry(key).or_insert_with(|| {
            Arc::new(InstructionData {
                mnemonic: mnemonic.to_string(),
                operands: operands.to_string(),
            })
        }));
        Instruction {
            address,
            call_target,
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.interned.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.read().is_empty()
    }

    pub fn clear(&self) {
        self.interned.write().clear();
    }
}

fn intern_key(mnemonic: &str, operands: &str) -> u128 {
    let mut hasher = Sha256::new();
    hasher.update(mnemonic.as_bytes());
    hasher.update([0u8]);
    hasher.update(operands.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    u128::from_le_bytes(bytes)
}
