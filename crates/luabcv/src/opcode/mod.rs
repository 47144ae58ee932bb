mod instruction;

pub use instruction::Instruction;

/// Instruction format modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
    IAx,
}

/// Meaning of the B and C operand fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgMode {
    /// Field is not used by the instruction.
    Unused,
    /// Field is used, but is neither a register nor a constant index.
    Value,
    /// Field is a register index (or a jump offset for iAsBx opcodes).
    Reg,
    /// Field is a register index or, with the K bit set, a constant index.
    RegConst,
}

/// Complete Lua 5.2 Opcode Set (40 opcodes)
///
/// The encoding order matches the bytecode this crate accepts: `LOADK` with
/// `Bx = 0` takes its constant index from a following `EXTRAARG` (there is no
/// separate LOADKX opcode), `CLOSE` exists, and `LOADNIL` spans R(A)..R(B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move = 0, // R(A) := R(B)
    LoadK,    // R(A) := Kst(Bx-1), or Kst(extra arg) when Bx == 0
    LoadBool, // R(A) := (Bool)B; if (C) pc++
    LoadNil,  // R(A), R(A+1), ..., R(B) := nil
    GetUpval, // R(A) := UpValue[B]
    GetTabUp, // R(A) := UpValue[B][RK(C)]
    GetTable, // R(A) := R(B)[RK(C)]
    SetTabUp, // UpValue[A][RK(B)] := RK(C)
    SetUpval, // UpValue[B] := R(A)
    SetTable, // R(A)[RK(B)] := RK(C)
    NewTable, // R(A) := {} (size = B,C)
    Self_,    // R(A+1) := R(B); R(A) := R(B)[RK(C)]
    Add,      // R(A) := RK(B) + RK(C)
    Sub,      // R(A) := RK(B) - RK(C)
    Mul,      // R(A) := RK(B) * RK(C)
    Div,      // R(A) := RK(B) / RK(C)
    Mod,      // R(A) := RK(B) % RK(C)
    Pow,      // R(A) := RK(B) ^ RK(C)
    Unm,      // R(A) := -R(B)
    Not,      // R(A) := not R(B)
    Len,      // R(A) := length of R(B)
    Concat,   // R(A) := R(B).. ... ..R(C)
    Jmp,      // pc += sBx
    Eq,       // if ((RK(B) == RK(C)) ~= A) then pc++
    Lt,       // if ((RK(B) <  RK(C)) ~= A) then pc++
    Le,       // if ((RK(B) <= RK(C)) ~= A) then pc++
    Test,     // if not (R(A) <=> C) then pc++
    TestSet,  // if (R(B) <=> C) then R(A) := R(B) else pc++
    Call,     // R(A), ... ,R(A+C-2) := R(A)(R(A+1), ... ,R(A+B-1))
    TailCall, // return R(A)(R(A+1), ... ,R(A+B-1))
    Return,   // return R(A), ... ,R(A+B-2)
    ForLoop,  // R(A) += R(A+2); if R(A) <?= R(A+1) then { pc += sBx; R(A+3) = R(A) }
    ForPrep,  // R(A) -= R(A+2); pc += sBx
    TForCall, // R(A+3), ... ,R(A+2+C) := R(A)(R(A+1), R(A+2))
    TForLoop, // if R(A+1) ~= nil then { R(A) = R(A+1); pc += sBx }
    SetList,  // R(A)[(C-1)*FPF+i] := R(A+i), 1 <= i <= B
    Close,    // close all upvalues >= R(A)
    Closure,  // R(A) := closure(KPROTO[B])
    Vararg,   // R(A), R(A+1), ..., R(A+B-2) = vararg
    ExtraArg, // extra (larger) argument for previous opcode
}

impl OpCode {
    pub const COUNT: usize = 40;

    pub fn from_byte(byte: u8) -> Option<OpCode> {
        use OpCode::*;
        const TABLE: [OpCode; OpCode::COUNT] = [
            Move, LoadK, LoadBool, LoadNil, GetUpval, GetTabUp, GetTable, SetTabUp, SetUpval,
            SetTable, NewTable, Self_, Add, Sub, Mul, Div, Mod, Pow, Unm, Not, Len, Concat, Jmp,
            Eq, Lt, Le, Test, TestSet, Call, TailCall, Return, ForLoop, ForPrep, TForCall,
            TForLoop, SetList, Close, Closure, Vararg, ExtraArg,
        ];
        TABLE.get(byte as usize).copied()
    }

    /// Get the instruction format mode for this opcode
    pub fn mode(self) -> OpMode {
        use OpCode::*;
        match self {
            // iABx format (unsigned Bx)
            LoadK | Closure => OpMode::IABx,

            // iAsBx format (signed Bx)
            Jmp | ForLoop | ForPrep | TForLoop => OpMode::IAsBx,

            // iAx format
            ExtraArg => OpMode::IAx,

            // iABC format (everything else)
            _ => OpMode::IABC,
        }
    }

    /// Whether the A field names a destination register (A-mode).
    ///
    /// Static validation checks A against the register window for these
    /// opcodes, and the simulator's default behaviour assigns an untyped
    /// value to R(A).
    pub fn sets_a(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            Move | LoadK
                | LoadBool
                | LoadNil
                | GetUpval
                | GetTabUp
                | GetTable
                | NewTable
                | Self_
                | Add
                | Sub
                | Mul
                | Div
                | Mod
                | Pow
                | Unm
                | Not
                | Len
                | Concat
                | TestSet
                | Call
                | TailCall
                | ForLoop
                | ForPrep
                | TForLoop
                | Closure
                | Vararg
        )
    }

    pub fn b_mode(self) -> ArgMode {
        use OpCode::*;
        match self {
            Move | LoadNil | GetTable | Self_ | Unm | Not | Len | Concat | TestSet | Jmp
            | ForLoop | ForPrep | TForLoop => ArgMode::Reg,
            LoadK | SetTabUp | SetTable | Add | Sub | Mul | Div | Mod | Pow | Eq | Lt | Le => {
                ArgMode::RegConst
            }
            LoadBool | GetUpval | GetTabUp | SetUpval | NewTable | Call | TailCall | Return
            | SetList | Closure | Vararg | ExtraArg => ArgMode::Value,
            Test | TForCall | Close => ArgMode::Unused,
        }
    }

    pub fn c_mode(self) -> ArgMode {
        use OpCode::*;
        match self {
            Concat => ArgMode::Reg,
            GetTabUp | GetTable | SetTabUp | SetTable | Self_ | Add | Sub | Mul | Div | Mod
            | Pow | Eq | Lt | Le => ArgMode::RegConst,
            LoadBool | NewTable | Test | TestSet | Call | TailCall | TForCall | SetList
            | ExtraArg => ArgMode::Value,
            _ => ArgMode::Unused,
        }
    }

    /// Whether this is a test opcode (T-mode): the following instruction
    /// must be a `JMP`, and execution selects between skipping it or not.
    pub fn is_test(self) -> bool {
        use OpCode::*;
        matches!(self, Eq | Lt | Le | Test | TestSet)
    }

    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadK => "LOADK",
            LoadBool => "LOADBOOL",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            GetTabUp => "GETTABUP",
            GetTable => "GETTABLE",
            SetTabUp => "SETTABUP",
            SetUpval => "SETUPVAL",
            SetTable => "SETTABLE",
            NewTable => "NEWTABLE",
            Self_ => "SELF",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Pow => "POW",
            Unm => "UNM",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            Test => "TEST",
            TestSet => "TESTSET",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            ForLoop => "FORLOOP",
            ForPrep => "FORPREP",
            TForCall => "TFORCALL",
            TForLoop => "TFORLOOP",
            SetList => "SETLIST",
            Close => "CLOSE",
            Closure => "CLOSURE",
            Vararg => "VARARG",
            ExtraArg => "EXTRAARG",
        }
    }
}
