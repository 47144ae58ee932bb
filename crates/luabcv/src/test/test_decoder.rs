// Decoder tests: header validation, stream structure, resumability,
// recursion bounds and memory accounting.

use super::chunk::{self, Constant, Endian, ProtoSpec};
use crate::decoder::{DecodeOptions, Decoder, MemoryQuota};
use crate::error::VerifyError;
use crate::opcode::{Instruction, OpCode};

fn simple_chunk() -> Vec<u8> {
    chunk::dump(&ProtoSpec::default())
}

#[test]
fn test_decode_simple_chunk() {
    let proto = chunk::decode(&simple_chunk()).unwrap();
    assert_eq!(proto.num_params(), 0);
    assert_eq!(proto.num_regs(), 2);
    assert!(!proto.is_vararg());
    assert_eq!(proto.num_instructions(), 1);
    assert_eq!(proto.num_constants(), 0);
    assert_eq!(proto.num_prototypes(), 0);
    assert_eq!(proto.num_upvalues(), 0);

    let (op, a, b, c) = proto.instruction(0).unwrap();
    assert_eq!(op, OpCode::Return);
    assert_eq!((a, b, c), (0, 1, 0));
    assert!(proto.instruction(1).is_none());
}

#[test]
fn test_decode_constants_and_children() {
    let spec = ProtoSpec {
        num_params: 1,
        is_vararg: true,
        num_regs: 5,
        constants: vec![
            Constant::Nil,
            Constant::Boolean(true),
            Constant::Number(42.5),
            Constant::Str("hello"),
        ],
        children: vec![ProtoSpec::default(), ProtoSpec::default()],
        upvalues: vec![(true, 0), (false, 1)],
        ..Default::default()
    };
    let proto = chunk::decode(&chunk::dump(&spec)).unwrap();
    assert_eq!(proto.num_params(), 1);
    assert!(proto.is_vararg());
    assert_eq!(proto.num_constants(), 4);
    assert_eq!(proto.num_prototypes(), 2);
    assert_eq!(proto.num_upvalues(), 2);
    assert!(proto.upvalues()[0].in_stack);
    assert!(!proto.upvalues()[1].in_stack);
    assert_eq!(proto.upvalues()[1].index, 1);
    assert_eq!(proto.prototypes()[0].num_instructions(), 1);
}

#[test]
fn test_big_endian_chunk_decodes_identically() {
    let spec = ProtoSpec {
        num_regs: 3,
        code: vec![
            Instruction::abx(OpCode::LoadK, 0, 1),
            Instruction::abc(OpCode::Return, 0, 2, 0),
        ],
        constants: vec![Constant::Number(1.0)],
        ..Default::default()
    };
    let little = chunk::decode(&chunk::dump_with(&spec, Endian::Little)).unwrap();
    let big = chunk::decode(&chunk::dump_with(&spec, Endian::Big)).unwrap();
    assert_eq!(little.num_instructions(), big.num_instructions());
    for pc in 0..little.num_instructions() {
        assert_eq!(little.instruction(pc), big.instruction(pc));
    }
}

#[test]
fn test_bad_signature() {
    let mut bytes = simple_chunk();
    bytes[0] = b'X';
    assert_eq!(
        chunk::decode(&bytes),
        Err(VerifyError::MalformedBytecode)
    );
}

#[test]
fn test_wrong_version() {
    let mut bytes = simple_chunk();
    bytes[4] = 0x51;
    assert_eq!(
        chunk::decode(&bytes),
        Err(VerifyError::UnsupportedVersion)
    );
}

#[test]
fn test_unofficial_format() {
    let mut bytes = simple_chunk();
    bytes[5] = 1;
    assert_eq!(
        chunk::decode(&bytes),
        Err(VerifyError::UnsupportedVersion)
    );
}

#[test]
fn test_bad_endian_byte() {
    let mut bytes = simple_chunk();
    bytes[6] = 7;
    assert_eq!(
        chunk::decode(&bytes),
        Err(VerifyError::MalformedBytecode)
    );
}

#[test]
fn test_zero_size_fields() {
    for offset in [7usize, 9] {
        let mut bytes = simple_chunk();
        bytes[offset] = 0;
        assert_eq!(
            chunk::decode(&bytes),
            Err(VerifyError::MalformedBytecode),
            "size byte at offset {} may not be zero",
            offset
        );
    }
}

#[test]
fn test_undersized_instructions() {
    // 3-byte instructions cannot hold the B field at bit 23.
    let mut bytes = simple_chunk();
    bytes[9] = 3;
    assert_eq!(
        chunk::decode(&bytes),
        Err(VerifyError::MalformedBytecode)
    );
}

#[test]
fn test_bad_tail() {
    let mut bytes = simple_chunk();
    bytes[17] ^= 0xFF;
    assert_eq!(
        chunk::decode(&bytes),
        Err(VerifyError::MalformedBytecode)
    );
}

#[test]
fn test_truncated_header() {
    let bytes = simple_chunk();
    let mut decoder = Decoder::new(DecodeOptions::default());
    decoder.pump(&bytes[..10]).unwrap();
    assert_eq!(decoder.finish(), Err(VerifyError::Truncated));
}

#[test]
fn test_truncated_body() {
    let bytes = simple_chunk();
    let mut decoder = Decoder::new(DecodeOptions::default());
    decoder.pump(&bytes[..bytes.len() - 1]).unwrap();
    assert_eq!(decoder.finish(), Err(VerifyError::Truncated));
}

#[test]
fn test_finish_without_input() {
    let decoder = Decoder::new(DecodeOptions::default());
    assert_eq!(decoder.finish(), Err(VerifyError::Truncated));
}

#[test]
fn test_surplus_bytes_single_pump() {
    let mut bytes = simple_chunk();
    bytes.push(0);
    assert_eq!(chunk::decode(&bytes), Err(VerifyError::SurplusInput));
}

#[test]
fn test_surplus_bytes_late_pump() {
    let bytes = simple_chunk();
    let mut decoder = Decoder::new(DecodeOptions::default());
    decoder.pump(&bytes).unwrap();
    assert_eq!(decoder.pump(&[0]), Err(VerifyError::SurplusInput));
    assert_eq!(decoder.finish(), Err(VerifyError::SurplusInput));
}

#[test]
fn test_empty_pump_is_a_yield() {
    let bytes = simple_chunk();
    let mut decoder = Decoder::new(DecodeOptions::default());
    decoder.pump(&[]).unwrap();
    decoder.pump(&bytes).unwrap();
    decoder.pump(&[]).unwrap();
    assert!(decoder.finish().is_ok());
}

#[test]
fn test_pump_after_failure_reports_same_error() {
    let mut bytes = simple_chunk();
    bytes[0] = b'X';
    let mut decoder = Decoder::new(DecodeOptions::default());
    assert_eq!(
        decoder.pump(&bytes),
        Err(VerifyError::MalformedBytecode)
    );
    assert_eq!(
        decoder.pump(&[1, 2, 3]),
        Err(VerifyError::MalformedBytecode)
    );
    assert_eq!(decoder.finish(), Err(VerifyError::MalformedBytecode));
}

#[test]
fn test_zero_instruction_prototype() {
    let spec = ProtoSpec {
        code: vec![],
        ..Default::default()
    };
    assert_eq!(
        chunk::decode(&chunk::dump(&spec)),
        Err(VerifyError::MalformedBytecode)
    );
}

#[test]
fn test_invalid_constant_tag() {
    let spec = ProtoSpec {
        constants: vec![Constant::Nil],
        ..Default::default()
    };
    let mut bytes = chunk::dump(&spec);
    // working back: 20 debug bytes, 4 upvalue count, 4 child count, the tag
    let tag_at = bytes.len() - 29;
    assert_eq!(bytes[tag_at], 0);
    bytes[tag_at] = 5; // LUA_TTABLE cannot appear in a constant table
    assert_eq!(chunk::decode(&bytes), Err(VerifyError::MalformedBytecode));
}

#[test]
fn test_invalid_boolean_payload() {
    let spec = ProtoSpec {
        constants: vec![Constant::Boolean(false)],
        ..Default::default()
    };
    let mut bytes = chunk::dump(&spec);
    // the boolean payload sits right before the child prototype count
    let payload_at = bytes.len() - 29;
    assert_eq!(bytes[payload_at], 0);
    bytes[payload_at] = 2;
    assert_eq!(chunk::decode(&bytes), Err(VerifyError::MalformedBytecode));
}

#[test]
fn test_integer_field_overflow() {
    // A 16-byte size_int whose instruction count cannot fit a host word.
    let mut bytes = vec![0x1b, b'L', b'u', b'a', 0x52, 0, 1, 16, 8, 4, 8, 0];
    bytes.extend_from_slice(chunk::TAIL);
    bytes.extend_from_slice(&[0u8; 32]); // line_defined, last_line_defined
    bytes.extend_from_slice(&[0, 0, 2]); // arity
    bytes.extend_from_slice(&[0xFF; 16]); // num_instructions
    assert_eq!(chunk::decode(&bytes), Err(VerifyError::MalformedBytecode));
}

#[test]
fn test_recursion_depth_limit() {
    let mut spec = ProtoSpec::default();
    for _ in 0..4 {
        spec = ProtoSpec {
            children: vec![spec],
            ..Default::default()
        };
    }
    let bytes = chunk::dump(&spec);

    let mut decoder = Decoder::new(DecodeOptions { max_proto_depth: 5 });
    decoder.pump(&bytes).unwrap();
    assert!(decoder.finish().is_ok());

    let mut decoder = Decoder::new(DecodeOptions { max_proto_depth: 4 });
    assert_eq!(
        decoder.pump(&bytes),
        Err(VerifyError::RecursionTooDeep)
    );
}

#[test]
fn test_byte_at_a_time_resumption() {
    let bytes = chunk::dump(&ProtoSpec {
        constants: vec![Constant::Str("x"), Constant::Number(8.0)],
        children: vec![ProtoSpec::default()],
        upvalues: vec![(true, 0)],
        ..Default::default()
    });
    let whole = chunk::decode(&bytes).unwrap();

    let mut decoder = Decoder::new(DecodeOptions::default());
    for &b in &bytes {
        decoder.pump(&[b]).unwrap();
    }
    let pieced = decoder.finish().unwrap();

    assert_eq!(pieced.num_instructions(), whole.num_instructions());
    assert_eq!(pieced.num_constants(), whole.num_constants());
    assert_eq!(pieced.num_prototypes(), whole.num_prototypes());
    assert_eq!(pieced.num_upvalues(), whole.num_upvalues());
    assert_eq!(pieced.instruction(0), whole.instruction(0));
}

#[test]
fn test_decode_memory_quota() {
    let bytes = simple_chunk();
    let mut decoder = Decoder::with_gauge(
        DecodeOptions::default(),
        Box::new(MemoryQuota::new(8)),
    );
    assert_eq!(decoder.pump(&bytes), Err(VerifyError::AllocationFailure));
}
