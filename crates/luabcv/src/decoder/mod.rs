//! Resumable decoder for Lua 5.2 binary chunks.
//!
//! The decoder is a state machine fed through [`Decoder::pump`]: each call
//! consumes one chunk of bytes, and a read that cannot be satisfied from the
//! bytes supplied so far simply suspends until the next call. The host ends
//! the session with [`Decoder::finish`], which either hands over the decoded
//! prototype tree or frees whatever partial state was built.
//!
//! Only the structure the verifier needs is kept: instruction words, constant
//! types, upvalue descriptors and arities. Constant payloads and the debug
//! section are validated for shape and discarded.

mod gauge;
mod prototype;

pub use gauge::{MemoryGauge, MemoryQuota, Unbounded};
pub use prototype::{LuaType, Prototype, UpvalueDesc};

use crate::error::{VerifyError, VerifyResult};
use crate::opcode::Instruction;
use tracing::debug;

const HEADER_SIZE: usize = 18;
const SCRATCH_SIZE: usize = 32;
const SIGNATURE: &[u8] = b"\x1bLua";
const VERSION_5_2: u8 = 0x52;
const FORMAT_OFFICIAL: u8 = 0;
const TAIL: &[u8] = b"\x19\x93\r\n\x1a\n";

/// Session limits, fixed when the decoder is created.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Maximum prototype nesting depth; deeper chunks are rejected.
    pub max_proto_depth: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_proto_depth: 256,
        }
    }
}

/// Parse an unsigned integer field gathered from the stream, honouring the
/// declared endianness. A significant byte that does not fit the host word
/// means the count cannot be honoured at all.
fn parse_uint(bytes: &[u8], stream_little: bool) -> Option<usize> {
    fn shift_in(acc: usize, byte: u8) -> Option<usize> {
        if acc > usize::MAX >> 8 {
            return None;
        }
        Some((acc << 8) | byte as usize)
    }
    let mut result: usize = 0;
    if stream_little {
        for &b in bytes.iter().rev() {
            result = shift_in(result, b)?;
        }
    } else {
        for &b in bytes {
            result = shift_in(result, b)?;
        }
    }
    Some(result)
}

/// Where the bytes of the read in progress are going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    /// Small fixed-size fields, gathered into the scratch buffer.
    Scratch,
    /// Raw instruction words, appended to the current prototype's code.
    Code,
    /// Skipped stream content (constant payloads, debug info).
    Discard,
}

/// Resume points of the state machine. Each variant names the processing
/// that runs once the read issued for it has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    SkipLines,
    Arity,
    CodeCount,
    Code,
    ConstCount,
    ConstTag,
    ConstBool,
    ConstNumber,
    ConstStrLen,
    ConstStr,
    ProtoCount,
    UpvalCount,
    UpvalPair,
    DebugSrcLen,
    DebugSrc,
    DebugLineCount,
    DebugLines,
    DebugLocCount,
    DebugLocStrLen,
    DebugLocStr,
    DebugLocPcs,
    DebugUpNameCount,
    DebugUpNameLen,
    DebugUpName,
    Done,
}

/// Build state for one prototype while its stream section is in flight.
/// Each frame owns its own loop position (the lengths of the growing
/// vectors), so suspension and recursion need no shared counters.
struct ProtoBuilder {
    code: Vec<u8>,
    num_instructions: usize,
    constant_types: Vec<LuaType>,
    num_constants: usize,
    prototypes: Vec<Prototype>,
    num_prototypes: usize,
    upvalues: Vec<UpvalueDesc>,
    num_upvalues: usize,
    num_params: u8,
    is_vararg: bool,
    num_regs: u8,
}

impl ProtoBuilder {
    fn new() -> Self {
        Self {
            code: Vec::new(),
            num_instructions: 0,
            constant_types: Vec::new(),
            num_constants: 0,
            prototypes: Vec::new(),
            num_prototypes: 0,
            upvalues: Vec::new(),
            num_upvalues: 0,
            num_params: 0,
            is_vararg: false,
            num_regs: 0,
        }
    }

    fn build(self, instruction_size: usize) -> Prototype {
        Prototype {
            code: self.code,
            instruction_size,
            num_instructions: self.num_instructions,
            constant_types: self.constant_types,
            prototypes: self.prototypes,
            upvalues: self.upvalues,
            num_regs: self.num_regs,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
        }
    }
}

/// A resumable decode session.
pub struct Decoder {
    options: DecodeOptions,
    gauge: Box<dyn MemoryGauge>,
    state: State,
    sink: Sink,
    need: usize,
    scratch: [u8; SCRATCH_SIZE],
    scratch_len: usize,
    stream_little: bool,
    size_int: usize,
    size_size: usize,
    size_ins: usize,
    size_num: usize,
    stack: Vec<ProtoBuilder>,
    counter: usize,
    root: Option<Prototype>,
    error: Option<VerifyError>,
}

impl Decoder {
    pub fn new(options: DecodeOptions) -> Self {
        Self::with_gauge(options, Box::new(Unbounded))
    }

    pub fn with_gauge(options: DecodeOptions, gauge: Box<dyn MemoryGauge>) -> Self {
        Self {
            options,
            gauge,
            state: State::Header,
            sink: Sink::Scratch,
            need: HEADER_SIZE,
            scratch: [0; SCRATCH_SIZE],
            scratch_len: 0,
            stream_little: true,
            size_int: 0,
            size_size: 0,
            size_ins: 0,
            size_num: 0,
            stack: Vec::new(),
            counter: 0,
            root: None,
            error: None,
        }
    }

    /// Feed the next chunk of the byte stream.
    ///
    /// `Ok(())` means the bytes were consumed and the decoder either finished
    /// or is suspended waiting for more input. Any error is sticky: the
    /// session has torn down its partial state and `finish` will report the
    /// same failure.
    pub fn pump(&mut self, chunk: &[u8]) -> VerifyResult<()> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let mut rest = chunk;
        match self.run(&mut rest) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail(err);
                Err(err)
            }
        }
    }

    /// End the session. Returns the root prototype if the stream formed a
    /// complete chunk with no surplus bytes; otherwise reports why not and
    /// drops any partially decoded state.
    pub fn finish(self) -> VerifyResult<Prototype> {
        if let Some(err) = self.error {
            return Err(err);
        }
        match (self.state, self.root) {
            (State::Done, Some(proto)) => Ok(proto),
            _ => Err(VerifyError::Truncated),
        }
    }

    fn fail(&mut self, err: VerifyError) {
        self.error = Some(err);
        self.stack.clear();
        self.root = None;
    }

    fn run(&mut self, chunk: &mut &[u8]) -> VerifyResult<()> {
        loop {
            if self.state == State::Done {
                if chunk.is_empty() {
                    return Ok(());
                }
                return Err(VerifyError::SurplusInput);
            }
            if !self.fill(chunk)? {
                return Ok(());
            }
            self.advance()?;
        }
    }

    /// Move bytes from the input into the pending read. `Ok(false)` means
    /// the input ran dry and the session is suspended.
    fn fill(&mut self, chunk: &mut &[u8]) -> VerifyResult<bool> {
        while self.need > 0 {
            if chunk.is_empty() {
                return Ok(false);
            }
            let n = self.need.min(chunk.len());
            let (head, rest) = chunk.split_at(n);
            match self.sink {
                Sink::Scratch => {
                    self.scratch[self.scratch_len..self.scratch_len + n].copy_from_slice(head);
                    self.scratch_len += n;
                }
                Sink::Code => {
                    let top = self.stack.last_mut().ok_or(VerifyError::Internal)?;
                    top.code.extend_from_slice(head);
                }
                Sink::Discard => {}
            }
            self.need -= n;
            *chunk = rest;
        }
        Ok(true)
    }

    /// Issue the next read and name the state that will consume it.
    fn want(&mut self, sink: Sink, need: usize, next: State) -> VerifyResult<()> {
        if sink == Sink::Scratch && need > SCRATCH_SIZE {
            return Err(VerifyError::Internal);
        }
        self.sink = sink;
        self.need = need;
        self.scratch_len = 0;
        self.state = next;
        Ok(())
    }

    fn want_int(&mut self, next: State) -> VerifyResult<()> {
        self.want(Sink::Scratch, self.size_int, next)
    }

    fn read_uint(&self, len: usize) -> VerifyResult<usize> {
        parse_uint(&self.scratch[..len], self.stream_little)
            .ok_or(VerifyError::MalformedBytecode)
    }

    fn claim(&mut self, bytes: usize) -> VerifyResult<()> {
        if self.gauge.claim(bytes) {
            Ok(())
        } else {
            Err(VerifyError::AllocationFailure)
        }
    }

    fn top(&self) -> VerifyResult<&ProtoBuilder> {
        self.stack.last().ok_or(VerifyError::Internal)
    }

    fn top_mut(&mut self) -> VerifyResult<&mut ProtoBuilder> {
        self.stack.last_mut().ok_or(VerifyError::Internal)
    }

    /// One transition of the state machine, run when its read has completed.
    fn advance(&mut self) -> VerifyResult<()> {
        match self.state {
            State::Header => {
                self.parse_header()?;
                self.start_proto()
            }
            State::SkipLines => self.want(Sink::Scratch, 3, State::Arity),
            State::Arity => {
                let (params, vararg, regs) = (self.scratch[0], self.scratch[1], self.scratch[2]);
                let top = self.top_mut()?;
                top.num_params = params;
                top.is_vararg = vararg != 0;
                top.num_regs = regs;
                self.want_int(State::CodeCount)
            }
            State::CodeCount => {
                let count = self.read_uint(self.size_int)?;
                if count == 0 {
                    return Err(VerifyError::MalformedBytecode);
                }
                let bytes = count
                    .checked_mul(self.size_ins)
                    .ok_or(VerifyError::MalformedBytecode)?;
                self.claim(bytes)?;
                self.top_mut()?.num_instructions = count;
                self.want(Sink::Code, bytes, State::Code)
            }
            State::Code => {
                // Normalise every instruction word to little-endian order.
                if !self.stream_little {
                    let size = self.size_ins;
                    let top = self.top_mut()?;
                    for ins in top.code.chunks_exact_mut(size) {
                        ins.reverse();
                    }
                }
                self.want_int(State::ConstCount)
            }
            State::ConstCount => {
                let count = self.read_uint(self.size_int)?;
                self.claim(count)?;
                self.top_mut()?.num_constants = count;
                self.next_constant()
            }
            State::ConstTag => {
                let ty = LuaType::from_tag(self.scratch[0])
                    .ok_or(VerifyError::MalformedBytecode)?;
                self.top_mut()?.constant_types.push(ty);
                match ty {
                    LuaType::Nil => self.next_constant(),
                    LuaType::Boolean => self.want(Sink::Scratch, 1, State::ConstBool),
                    LuaType::Number => self.want(Sink::Discard, self.size_num, State::ConstNumber),
                    LuaType::String => {
                        self.want(Sink::Scratch, self.size_size, State::ConstStrLen)
                    }
                    _ => Err(VerifyError::MalformedBytecode),
                }
            }
            State::ConstBool => {
                if self.scratch[0] > 1 {
                    return Err(VerifyError::MalformedBytecode);
                }
                self.next_constant()
            }
            State::ConstNumber => self.next_constant(),
            State::ConstStrLen => {
                let len = self.read_uint(self.size_size)?;
                self.want(Sink::Discard, len, State::ConstStr)
            }
            State::ConstStr => self.next_constant(),
            State::ProtoCount => {
                let count = self.read_uint(self.size_int)?;
                let bytes = count
                    .checked_mul(std::mem::size_of::<Prototype>())
                    .ok_or(VerifyError::MalformedBytecode)?;
                self.claim(bytes)?;
                self.top_mut()?.num_prototypes = count;
                if count > 0 {
                    self.start_proto()
                } else {
                    self.want_int(State::UpvalCount)
                }
            }
            State::UpvalCount => {
                let count = self.read_uint(self.size_int)?;
                let bytes = count.checked_mul(2).ok_or(VerifyError::MalformedBytecode)?;
                self.claim(bytes)?;
                self.top_mut()?.num_upvalues = count;
                if count > 0 {
                    self.want(Sink::Scratch, 2, State::UpvalPair)
                } else {
                    self.begin_debug()
                }
            }
            State::UpvalPair => {
                let desc = UpvalueDesc {
                    in_stack: self.scratch[0] != 0,
                    index: self.scratch[1],
                };
                let top = self.top_mut()?;
                top.upvalues.push(desc);
                if top.upvalues.len() < top.num_upvalues {
                    self.want(Sink::Scratch, 2, State::UpvalPair)
                } else {
                    self.begin_debug()
                }
            }
            State::DebugSrcLen => {
                let len = self.read_uint(self.size_size)?;
                self.want(Sink::Discard, len, State::DebugSrc)
            }
            State::DebugSrc => self.want_int(State::DebugLineCount),
            State::DebugLineCount => {
                let count = self.read_uint(self.size_int)?;
                let bytes = count
                    .checked_mul(self.size_int)
                    .ok_or(VerifyError::MalformedBytecode)?;
                self.want(Sink::Discard, bytes, State::DebugLines)
            }
            State::DebugLines => self.want_int(State::DebugLocCount),
            State::DebugLocCount => {
                self.counter = self.read_uint(self.size_int)?;
                self.next_locvar()
            }
            State::DebugLocStrLen => {
                let len = self.read_uint(self.size_size)?;
                self.want(Sink::Discard, len, State::DebugLocStr)
            }
            State::DebugLocStr => {
                self.want(Sink::Discard, self.size_int * 2, State::DebugLocPcs)
            }
            State::DebugLocPcs => {
                self.counter = self.counter.saturating_sub(1);
                self.next_locvar()
            }
            State::DebugUpNameCount => {
                self.counter = self.read_uint(self.size_int)?;
                self.next_upname()
            }
            State::DebugUpNameLen => {
                let len = self.read_uint(self.size_size)?;
                self.want(Sink::Discard, len, State::DebugUpName)
            }
            State::DebugUpName => {
                self.counter = self.counter.saturating_sub(1);
                self.next_upname()
            }
            State::Done => Err(VerifyError::Internal),
        }
    }

    fn parse_header(&mut self) -> VerifyResult<()> {
        let header = &self.scratch[..HEADER_SIZE];
        if &header[..4] != SIGNATURE {
            return Err(VerifyError::MalformedBytecode);
        }
        if header[4] != VERSION_5_2 || header[5] != FORMAT_OFFICIAL {
            return Err(VerifyError::UnsupportedVersion);
        }
        self.stream_little = match header[6] {
            0 => false,
            1 => true,
            _ => return Err(VerifyError::MalformedBytecode),
        };
        self.size_int = header[7] as usize;
        self.size_size = header[8] as usize;
        self.size_ins = header[9] as usize;
        self.size_num = header[10] as usize;
        // header[11] says whether numbers are integral; the verifier only
        // ever skips number payloads, so it does not care.
        if self.size_int == 0 || self.size_ins == 0 {
            return Err(VerifyError::MalformedBytecode);
        }
        if self.size_int > SCRATCH_SIZE || self.size_size > SCRATCH_SIZE {
            return Err(VerifyError::MalformedBytecode);
        }
        // Every field position used by the opcode layouts must fit.
        let ins_bits = self.size_ins * 8;
        if Instruction::POS_OP + Instruction::SIZE_OP > ins_bits
            || Instruction::POS_A + Instruction::SIZE_A > ins_bits
            || Instruction::POS_B + Instruction::SIZE_B > ins_bits
            || Instruction::POS_C + Instruction::SIZE_C > ins_bits
            || Instruction::POS_BX + Instruction::SIZE_BX > ins_bits
            || Instruction::POS_AX + Instruction::SIZE_AX > ins_bits
        {
            return Err(VerifyError::MalformedBytecode);
        }
        if &header[12..HEADER_SIZE] != TAIL {
            return Err(VerifyError::MalformedBytecode);
        }
        debug!(
            little_endian = self.stream_little,
            size_int = self.size_int,
            size_size_t = self.size_size,
            size_instruction = self.size_ins,
            size_number = self.size_num,
            "bytecode header accepted"
        );
        Ok(())
    }

    /// Begin decoding a prototype: push a build frame and skip the two
    /// line-number fields that open every function body.
    fn start_proto(&mut self) -> VerifyResult<()> {
        if self.stack.len() >= self.options.max_proto_depth {
            return Err(VerifyError::RecursionTooDeep);
        }
        self.claim(std::mem::size_of::<ProtoBuilder>())?;
        self.stack.push(ProtoBuilder::new());
        self.want(Sink::Discard, self.size_int * 2, State::SkipLines)
    }

    fn next_constant(&mut self) -> VerifyResult<()> {
        let top = self.top()?;
        if top.constant_types.len() < top.num_constants {
            self.want(Sink::Scratch, 1, State::ConstTag)
        } else {
            self.want_int(State::ProtoCount)
        }
    }

    fn begin_debug(&mut self) -> VerifyResult<()> {
        self.want(Sink::Scratch, self.size_size, State::DebugSrcLen)
    }

    fn next_locvar(&mut self) -> VerifyResult<()> {
        if self.counter > 0 {
            self.want(Sink::Scratch, self.size_size, State::DebugLocStrLen)
        } else {
            self.want_int(State::DebugUpNameCount)
        }
    }

    fn next_upname(&mut self) -> VerifyResult<()> {
        if self.counter > 0 {
            self.want(Sink::Scratch, self.size_size, State::DebugUpNameLen)
        } else {
            self.finish_proto()
        }
    }

    /// The debug section was the last part of a function body: pop the
    /// frame and hand the prototype to its parent, or declare the stream
    /// complete if this was the root.
    fn finish_proto(&mut self) -> VerifyResult<()> {
        let builder = self.stack.pop().ok_or(VerifyError::Internal)?;
        let proto = builder.build(self.size_ins);
        debug!(
            instructions = proto.num_instructions(),
            constants = proto.num_constants(),
            children = proto.num_prototypes(),
            upvalues = proto.num_upvalues(),
            regs = proto.num_regs(),
            depth = self.stack.len(),
            "prototype decoded"
        );
        match self.stack.last_mut() {
            None => {
                self.root = Some(proto);
                self.need = 0;
                self.state = State::Done;
                Ok(())
            }
            Some(parent) => {
                parent.prototypes.push(proto);
                if parent.prototypes.len() < parent.num_prototypes {
                    self.start_proto()
                } else {
                    self.want_int(State::UpvalCount)
                }
            }
        }
    }
}
