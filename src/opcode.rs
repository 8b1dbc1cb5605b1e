//! AML opcode table and bytecode cursor
//!
//! Every AML operation is identified by a single byte, or by a two-byte
//! sequence starting with the `0x5b` extended prefix. The opcode table maps
//! each encoding to an operand schema consumed by the interpreter's decode
//! loop. Bytes that start a name path are not opcodes; the decoder detects
//! them with [`crate::name::is_name_lead`] before consulting this table.

use crate::error::AmlError;

use core::fmt;

/// Extended opcodes are keyed as `0x5b00 | second_byte`.
pub const EXT_PREFIX: u8 = 0x5b;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u16)]
/// Operation representation for the interpreter.
///
/// Discriminants are the wire encoding: the raw byte for one-byte opcodes,
/// `0x5b00 | byte` for extended ones. Data prefixes (`0x0a`..`0x0e`, string)
/// and the constant opcodes are listed too since the decoder dispatches over
/// all of them uniformly.
pub enum Opcode {
    /// Integer constant `0`. Also doubles as the null-name target encoding.
    Zero = 0x00,
    /// Integer constant `1`.
    One = 0x01,
    /// Declares a second name for an existing object.
    Alias = 0x06,
    /// Declares a named object with an initial value.
    Name = 0x08,
    /// One-byte integer literal.
    BytePrefix = 0x0a,
    /// Two-byte integer literal.
    WordPrefix = 0x0b,
    /// Four-byte integer literal.
    DWordPrefix = 0x0c,
    /// Nul-terminated ASCII string literal.
    StringPrefix = 0x0d,
    /// Eight-byte integer literal.
    QWordPrefix = 0x0e,
    /// Opens an existing scope for additional declarations.
    Scope = 0x10,
    /// Builds a buffer from a size expression and a byte image.
    Buffer = 0x11,
    /// Builds a fixed-count package.
    Package = 0x12,
    /// Builds a package whose count is a runtime expression.
    VarPackage = 0x13,
    /// Declares a control method.
    Method = 0x14,
    /// Declares an external name (disassembly aid; ignored at runtime).
    External = 0x15,
    /// Stores an expression result into a target.
    Store = 0x70,
    /// Produces a reference to a name, local, or argument.
    RefOf = 0x71,
    /// Integer addition.
    Add = 0x72,
    /// Concatenates two data objects.
    Concat = 0x73,
    /// Integer subtraction.
    Subtract = 0x74,
    /// Adds one to the referent in place.
    Increment = 0x75,
    /// Subtracts one from the referent in place.
    Decrement = 0x76,
    /// Integer multiplication.
    Multiply = 0x77,
    /// Integer division with separate quotient and remainder targets.
    Divide = 0x78,
    /// Logical shift left.
    ShiftLeft = 0x79,
    /// Logical shift right.
    ShiftRight = 0x7a,
    /// Bitwise and.
    And = 0x7b,
    /// Bitwise nand.
    Nand = 0x7c,
    /// Bitwise or.
    Or = 0x7d,
    /// Bitwise nor.
    Nor = 0x7e,
    /// Bitwise xor.
    Xor = 0x7f,
    /// Bitwise not.
    Not = 0x80,
    /// Index of the most significant set bit, one-based.
    FindSetLeftBit = 0x81,
    /// Index of the least significant set bit, one-based.
    FindSetRightBit = 0x82,
    /// Collapses a reference chain to its ultimate target object.
    DerefOf = 0x83,
    /// Concatenates two resource templates, merging end tags.
    ConcatRes = 0x84,
    /// Integer modulus.
    Mod = 0x85,
    /// Queues a notification against a device node.
    Notify = 0x86,
    /// Byte length or element count of an object.
    SizeOf = 0x87,
    /// Produces an index reference into a buffer, string, or package.
    Index = 0x88,
    /// Searches a package with two comparison predicates.
    Match = 0x89,
    /// Declares a four-byte field over a buffer.
    CreateDWordField = 0x8a,
    /// Declares a two-byte field over a buffer.
    CreateWordField = 0x8b,
    /// Declares a one-byte field over a buffer.
    CreateByteField = 0x8c,
    /// Declares a one-bit field over a buffer.
    CreateBitField = 0x8d,
    /// Type tag of an object.
    ObjectType = 0x8e,
    /// Declares an eight-byte field over a buffer.
    CreateQWordField = 0x8f,
    /// Logical and over two integers.
    LAnd = 0x90,
    /// Logical or over two integers.
    LOr = 0x91,
    /// Logical negation.
    LNot = 0x92,
    /// Equality comparison.
    LEqual = 0x93,
    /// Greater-than comparison.
    LGreater = 0x94,
    /// Less-than comparison.
    LLess = 0x95,
    /// Explicit conversion to buffer.
    ToBuffer = 0x96,
    /// Explicit conversion to a decimal string.
    ToDecimalString = 0x97,
    /// Explicit conversion to a hexadecimal string.
    ToHexString = 0x98,
    /// Explicit conversion to integer.
    ToInteger = 0x99,
    /// Buffer-to-string conversion with a length bound.
    ToString = 0x9c,
    /// Stores a deep copy without implicit conversion.
    CopyObject = 0x9d,
    /// Extracts a substring or sub-buffer.
    Mid = 0x9e,
    /// Restarts the innermost enclosing `While`.
    Continue = 0x9f,
    /// Conditional block.
    If = 0xa0,
    /// Alternative block bound to the preceding `If`.
    Else = 0xa1,
    /// Loop block with a re-evaluated predicate.
    While = 0xa2,
    /// No operation.
    Noop = 0xa3,
    /// Returns a value from the running method.
    Return = 0xa4,
    /// Exits the innermost enclosing `While`.
    Break = 0xa5,
    /// Debugger breakpoint; a no-op in production builds.
    BreakPoint = 0xcc,
    /// Integer constant with all bits set.
    Ones = 0xff,

    /// Declares an AML-visible mutex with a sync level.
    Mutex = 0x5b01,
    /// Declares an AML-visible event.
    Event = 0x5b02,
    /// `RefOf` that yields false instead of aborting on a missing name.
    CondRefOf = 0x5b12,
    /// Declares a bit-exact field over a buffer.
    CreateField = 0x5b13,
    /// Finds a table by signature and loads it.
    LoadTable = 0x5b1f,
    /// Loads a table whose image comes from an object.
    Load = 0x5b20,
    /// Busy-waits for a microsecond count.
    Stall = 0x5b21,
    /// Sleeps for a millisecond count.
    Sleep = 0x5b22,
    /// Acquires an AML mutex with a millisecond timeout.
    Acquire = 0x5b23,
    /// Signals an AML event.
    Signal = 0x5b24,
    /// Waits on an AML event with a millisecond timeout.
    Wait = 0x5b25,
    /// Resets an AML event's pending count.
    Reset = 0x5b26,
    /// Releases an AML mutex.
    Release = 0x5b27,
    /// Converts binary-coded decimal to integer.
    FromBcd = 0x5b28,
    /// Converts integer to binary-coded decimal.
    ToBcd = 0x5b29,
    /// Unloads a previously loaded table.
    Unload = 0x5b2a,
    /// Interpreter revision constant.
    Revision = 0x5b30,
    /// The debug output object; valid only as a store target.
    Debug = 0x5b31,
    /// Reports an unrecoverable firmware error to the host.
    Fatal = 0x5b32,
    /// Monotonic timer in 100ns units.
    Timer = 0x5b33,
    /// Declares an operation region in an address space.
    OpRegion = 0x5b80,
    /// Declares field units over an operation region.
    Field = 0x5b81,
    /// Declares a device node and scope.
    Device = 0x5b82,
    /// Declares a processor node and scope.
    Processor = 0x5b83,
    /// Declares a power resource node and scope.
    PowerResource = 0x5b84,
    /// Declares a thermal zone node and scope.
    ThermalZone = 0x5b85,
    /// Declares fields accessed indirectly through index/data fields.
    IndexField = 0x5b86,
    /// Declares banked fields selected by a bank value.
    BankField = 0x5b87,
    /// Declares a region windowing another ACPI table.
    DataRegion = 0x5b88,
}

/// Kind of operand the decoder must produce for one schema position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// A full expression, evaluated to an object.
    TermArg,
    /// A storable location; the null name is permitted and discards.
    Target,
    /// A reference-able location; the null name is not permitted.
    SuperName,
    /// A literal name path, not resolved by the decoder.
    NameString,
    /// One literal byte.
    ByteData,
    /// Two literal bytes, little endian.
    WordData,
    /// Four literal bytes, little endian.
    DWordData,
}

/// Dispatch class of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Inline constant or data prefix; the decoder produces the value itself.
    Data,
    /// Generic expression executed from its operand schema.
    Expr,
    /// Statement executed from its operand schema, result discarded.
    Statement,
    /// Declaration or block with bespoke decode logic in the interpreter.
    Structured,
}

/// Static operand schema and class for one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    /// Operand positions, decoded left to right.
    pub args: &'static [ArgType],
    /// Dispatch class.
    pub class: OpClass,
}

use ArgType::*;

const fn info(args: &'static [ArgType], class: OpClass) -> OpInfo {
    OpInfo { args, class }
}

impl Opcode {
    /// Operand schema and dispatch class for this opcode.
    pub const fn op_info(self) -> OpInfo {
        match self {
            Self::Zero | Self::One | Self::Ones => info(&[], OpClass::Data),
            Self::Revision | Self::Timer => info(&[], OpClass::Expr),
            Self::BytePrefix
            | Self::WordPrefix
            | Self::DWordPrefix
            | Self::QWordPrefix
            | Self::StringPrefix
            | Self::Debug => info(&[], OpClass::Data),

            Self::Store => info(&[TermArg, SuperName], OpClass::Expr),
            Self::RefOf => info(&[SuperName], OpClass::Expr),
            Self::CondRefOf => info(&[SuperName, Target], OpClass::Expr),
            Self::Add
            | Self::Subtract
            | Self::Multiply
            | Self::ShiftLeft
            | Self::ShiftRight
            | Self::And
            | Self::Nand
            | Self::Or
            | Self::Nor
            | Self::Xor
            | Self::Mod
            | Self::Concat
            | Self::ConcatRes => info(&[TermArg, TermArg, Target], OpClass::Expr),
            Self::Divide => info(&[TermArg, TermArg, Target, Target], OpClass::Expr),
            Self::Increment | Self::Decrement => info(&[SuperName], OpClass::Expr),
            Self::Not | Self::FindSetLeftBit | Self::FindSetRightBit => {
                info(&[TermArg, Target], OpClass::Expr)
            }
            Self::DerefOf => info(&[TermArg], OpClass::Expr),
            Self::SizeOf | Self::ObjectType => info(&[SuperName], OpClass::Expr),
            Self::Index => info(&[TermArg, TermArg, Target], OpClass::Expr),
            Self::Match => info(
                &[TermArg, ByteData, TermArg, ByteData, TermArg, TermArg],
                OpClass::Expr,
            ),
            Self::LAnd | Self::LOr | Self::LEqual | Self::LGreater | Self::LLess => {
                info(&[TermArg, TermArg], OpClass::Expr)
            }
            Self::LNot => info(&[TermArg], OpClass::Expr),
            Self::ToBuffer
            | Self::ToDecimalString
            | Self::ToHexString
            | Self::ToInteger
            | Self::FromBcd
            | Self::ToBcd => info(&[TermArg, Target], OpClass::Expr),
            Self::ToString => info(&[TermArg, TermArg, Target], OpClass::Expr),
            Self::CopyObject => info(&[TermArg, SuperName], OpClass::Expr),
            Self::Mid => info(&[TermArg, TermArg, TermArg, Target], OpClass::Expr),
            Self::Acquire => info(&[SuperName, WordData], OpClass::Expr),
            Self::Wait => info(&[SuperName, TermArg], OpClass::Expr),
            Self::Load => info(&[SuperName, Target], OpClass::Expr),
            Self::LoadTable => info(
                &[TermArg, TermArg, TermArg, TermArg, TermArg, TermArg],
                OpClass::Expr,
            ),

            Self::Notify => info(&[SuperName, TermArg], OpClass::Statement),
            Self::Sleep | Self::Stall | Self::Unload => info(&[TermArg], OpClass::Statement),
            Self::Release | Self::Reset | Self::Signal => {
                info(&[SuperName], OpClass::Statement)
            }
            Self::Fatal => info(&[ByteData, DWordData, TermArg], OpClass::Statement),
            Self::Return => info(&[TermArg], OpClass::Statement),
            Self::Break | Self::Continue | Self::Noop | Self::BreakPoint => {
                info(&[], OpClass::Statement)
            }

            Self::CreateBitField
            | Self::CreateByteField
            | Self::CreateWordField
            | Self::CreateDWordField
            | Self::CreateQWordField => info(&[TermArg, TermArg, NameString], OpClass::Expr),
            Self::CreateField => {
                info(&[TermArg, TermArg, TermArg, NameString], OpClass::Expr)
            }

            Self::Alias
            | Self::Name
            | Self::Scope
            | Self::Buffer
            | Self::Package
            | Self::VarPackage
            | Self::Method
            | Self::External
            | Self::If
            | Self::Else
            | Self::While
            | Self::Mutex
            | Self::Event
            | Self::OpRegion
            | Self::Field
            | Self::Device
            | Self::Processor
            | Self::PowerResource
            | Self::ThermalZone
            | Self::IndexField
            | Self::BankField
            | Self::DataRegion => info(&[], OpClass::Structured),
        }
    }

    /// Map a decoded key (`byte` or `0x5b00 | byte`) to an opcode.
    pub fn from_key(key: u16) -> Option<Self> {
        use Opcode::*;
        let op = match key {
            0x00 => Zero,
            0x01 => One,
            0x06 => Alias,
            0x08 => Name,
            0x0a => BytePrefix,
            0x0b => WordPrefix,
            0x0c => DWordPrefix,
            0x0d => StringPrefix,
            0x0e => QWordPrefix,
            0x10 => Scope,
            0x11 => Buffer,
            0x12 => Package,
            0x13 => VarPackage,
            0x14 => Method,
            0x15 => External,
            0x70 => Store,
            0x71 => RefOf,
            0x72 => Add,
            0x73 => Concat,
            0x74 => Subtract,
            0x75 => Increment,
            0x76 => Decrement,
            0x77 => Multiply,
            0x78 => Divide,
            0x79 => ShiftLeft,
            0x7a => ShiftRight,
            0x7b => And,
            0x7c => Nand,
            0x7d => Or,
            0x7e => Nor,
            0x7f => Xor,
            0x80 => Not,
            0x81 => FindSetLeftBit,
            0x82 => FindSetRightBit,
            0x83 => DerefOf,
            0x84 => ConcatRes,
            0x85 => Mod,
            0x86 => Notify,
            0x87 => SizeOf,
            0x88 => Index,
            0x89 => Match,
            0x8a => CreateDWordField,
            0x8b => CreateWordField,
            0x8c => CreateByteField,
            0x8d => CreateBitField,
            0x8e => ObjectType,
            0x8f => CreateQWordField,
            0x90 => LAnd,
            0x91 => LOr,
            0x92 => LNot,
            0x93 => LEqual,
            0x94 => LGreater,
            0x95 => LLess,
            0x96 => ToBuffer,
            0x97 => ToDecimalString,
            0x98 => ToHexString,
            0x99 => ToInteger,
            0x9c => ToString,
            0x9d => CopyObject,
            0x9e => Mid,
            0x9f => Continue,
            0xa0 => If,
            0xa1 => Else,
            0xa2 => While,
            0xa3 => Noop,
            0xa4 => Return,
            0xa5 => Break,
            0xcc => BreakPoint,
            0xff => Ones,
            0x5b01 => Mutex,
            0x5b02 => Event,
            0x5b12 => CondRefOf,
            0x5b13 => CreateField,
            0x5b1f => LoadTable,
            0x5b20 => Load,
            0x5b21 => Stall,
            0x5b22 => Sleep,
            0x5b23 => Acquire,
            0x5b24 => Signal,
            0x5b25 => Wait,
            0x5b26 => Reset,
            0x5b27 => Release,
            0x5b28 => FromBcd,
            0x5b29 => ToBcd,
            0x5b2a => Unload,
            0x5b30 => Revision,
            0x5b31 => Debug,
            0x5b32 => Fatal,
            0x5b33 => Timer,
            0x5b80 => OpRegion,
            0x5b81 => Field,
            0x5b82 => Device,
            0x5b83 => Processor,
            0x5b84 => PowerResource,
            0x5b85 => ThermalZone,
            0x5b86 => IndexField,
            0x5b87 => BankField,
            0x5b88 => DataRegion,
            _ => return None,
        };
        Some(op)
    }

    /// Wire encoding key of this opcode.
    pub const fn key(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Bounds-checked cursor over a window of an AML byte stream.
///
/// Positions are absolute offsets into the containing table so they can be
/// stored in frames and blocks without carrying the borrow around.
#[derive(Debug)]
pub struct Stream<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Stream<'a> {
    /// Cursor over `data[pos..end]`.
    pub fn new(data: &'a [u8], pos: usize, end: usize) -> Self {
        let end = end.min(data.len());
        Self { data, pos, end }
    }

    /// Current absolute offset.
    pub const fn pos(&self) -> usize {
        self.pos
    }

    /// Absolute end of the window.
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Remaining bytes in the window.
    pub const fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    /// Move the cursor to an absolute offset within the window.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.end);
    }

    /// Next byte without consuming it.
    pub fn peek_u8(&self) -> Option<u8> {
        (self.pos < self.end).then(|| self.data[self.pos])
    }

    /// Consume one byte.
    pub fn read_u8(&mut self) -> Result<u8, AmlError> {
        let b = self
            .peek_u8()
            .ok_or(AmlError::BadBytecode("truncated stream"))?;
        self.pos += 1;
        Ok(b)
    }

    /// Consume a little-endian word.
    pub fn read_u16(&mut self) -> Result<u16, AmlError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Consume a little-endian dword.
    pub fn read_u32(&mut self) -> Result<u32, AmlError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Consume a little-endian qword.
    pub fn read_u64(&mut self) -> Result<u64, AmlError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Consume `n` raw bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], AmlError> {
        if self.remaining() < n {
            return Err(AmlError::BadBytecode("truncated stream"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Consume an opcode key: one byte, or two when the extended prefix
    /// leads.
    pub fn read_opcode_key(&mut self) -> Result<u16, AmlError> {
        let lead = self.read_u8()?;
        if lead == EXT_PREFIX {
            let ext = self.read_u8()?;
            Ok(0x5b00 | ext as u16)
        } else {
            Ok(lead as u16)
        }
    }

    /// Decode a PkgLength and return the absolute offset one past the
    /// package, measured from the PkgLength's own first byte.
    ///
    /// The 2-bit lead count selects 0..=3 follow bytes; with follow bytes the
    /// lead contributes only its low nibble.
    pub fn pkg_length(&mut self) -> Result<usize, AmlError> {
        let start = self.pos;
        let length = self.pkg_length_raw()?;
        let end = start
            .checked_add(length)
            .ok_or(AmlError::BadBytecode("package length overflow"))?;
        if end < self.pos || end > self.end {
            return Err(AmlError::BadBytecode("package length out of bounds"));
        }
        Ok(end)
    }

    /// Decode the PkgLength varint itself. Field lists reuse the encoding
    /// as a plain bit count, so no window check applies here.
    pub fn pkg_length_raw(&mut self) -> Result<usize, AmlError> {
        let lead = self.read_u8()?;
        let follow = (lead >> 6) as usize;
        if follow == 0 {
            return Ok((lead & 0x3f) as usize);
        }
        let mut length = (lead & 0x0f) as usize;
        for i in 0..follow {
            let byte = self.read_u8()? as usize;
            length |= byte << (4 + 8 * i);
        }
        Ok(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn opcode_key_round_trip() {
        for op in Opcode::iter() {
            assert_eq!(Opcode::from_key(op.key()), Some(op), "{op}");
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert_eq!(Opcode::from_key(0x02), None);
        assert_eq!(Opcode::from_key(0x5b03), None);
        assert_eq!(Opcode::from_key(0x1234), None);
    }

    #[test]
    fn extended_prefix_forms_two_byte_key() {
        let data = [EXT_PREFIX, 0x80, 0x70];
        let mut s = Stream::new(&data, 0, data.len());
        assert_eq!(s.read_opcode_key().unwrap(), 0x5b80);
        assert_eq!(s.read_opcode_key().unwrap(), 0x70);
    }

    #[test]
    fn pkg_length_single_byte() {
        let data = [0x0a, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut s = Stream::new(&data, 0, data.len());
        assert_eq!(s.pkg_length().unwrap(), 0x0a);
        assert_eq!(s.pos(), 1);
    }

    #[test]
    fn pkg_length_multi_byte() {
        // Two follow bytes: low nibble 0x2, then 0x34, 0x01 -> 0x1342.
        let mut data = vec![0x82, 0x34, 0x01];
        data.resize(0x1342, 0);
        let mut s = Stream::new(&data, 0, data.len());
        assert_eq!(s.pkg_length().unwrap(), 0x1342);
        assert_eq!(s.pos(), 3);
    }

    #[test]
    fn pkg_length_beyond_window_is_rejected() {
        let data = [0x3f, 0, 0];
        let mut s = Stream::new(&data, 0, data.len());
        assert!(s.pkg_length().is_err());
    }

    #[test]
    fn truncated_reads_are_rejected() {
        let data = [0x01];
        let mut s = Stream::new(&data, 0, data.len());
        assert!(s.read_u16().is_err());
        assert_eq!(s.read_u8().unwrap(), 0x01);
        assert!(s.read_u8().is_err());
    }

    #[test]
    fn every_expr_schema_ends_reasonably() {
        // Targets and names only ever trail value operands.
        for op in Opcode::iter() {
            let info = op.op_info();
            let mut seen_tail = false;
            for arg in info.args {
                match arg {
                    ArgType::Target | ArgType::NameString => seen_tail = true,
                    ArgType::TermArg => assert!(!seen_tail, "value after target in {op}"),
                    _ => {}
                }
            }
        }
    }
}
