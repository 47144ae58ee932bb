// Lua 5.2 bytecode safety verifier
// Decides, before a precompiled chunk is loaded, whether executing it could
// escape the VM's invariants: reads of uninitialised registers, invalid
// upvalue references, jumps outside the instruction array, mis-typed
// operands of type-specialised opcodes.

#[cfg(test)]
mod test;

pub mod decoder;
mod error;
pub mod opcode;
pub mod verifier;

pub use decoder::{
    DecodeOptions, Decoder, LuaType, MemoryGauge, MemoryQuota, Prototype, Unbounded, UpvalueDesc,
};
pub use error::{VerifyError, VerifyResult};
pub use opcode::{ArgMode, Instruction, OpCode, OpMode};
pub use verifier::{verify, verify_with};

/// Decode and verify a complete binary chunk held in memory.
///
/// A chunk that fails is simply never handed to the VM loader:
///
/// ```
/// assert!(luabcv::verify_bytes(b"\x1bLua not actually bytecode").is_err());
/// ```
pub fn verify_bytes(bytes: &[u8]) -> VerifyResult<()> {
    verify_chunks([bytes])
}

/// Decode and verify a binary chunk delivered in pieces, as a reader
/// callback or a chunked transport would produce it. Equivalent to
/// [`verify_bytes`] on the concatenation.
pub fn verify_chunks<I>(chunks: I) -> VerifyResult<()>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut decoder = Decoder::new(DecodeOptions::default());
    for chunk in chunks {
        decoder.pump(chunk.as_ref())?;
    }
    let proto = decoder.finish()?;
    verify(&proto)
}
