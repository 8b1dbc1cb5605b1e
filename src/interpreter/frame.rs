//! Method evaluation frames and in-flight opcode state
//!
//! A frame is one method invocation (or one table load) on the heap-backed
//! frame chain. The pending-operand stack converts nested term evaluation
//! into explicit continuations: an opcode that needs operands is pushed as
//! an [`InFlight`] and re-entered when its operands have been produced.

use crate::name::AmlName;
use crate::namespace::NodeRef;
use crate::object::{IntegerWidth, Method, ObjectRef};
use crate::opcode::{ArgType, Opcode};
use crate::table::Table;

use std::sync::Arc;
use std::time::Instant;

/// A decoded operand waiting for its consumer.
#[derive(Debug, Clone)]
pub(crate) enum Operand {
    /// Evaluated value.
    Value(ObjectRef),
    /// Storable location.
    Super(SuperTarget),
    /// Literal name path.
    Name(AmlName),
    /// `CondRefOf` probe that did not resolve.
    Missing,
}

/// A decoded SuperName: somewhere a value can be stored or referenced.
#[derive(Debug, Clone)]
pub(crate) enum SuperTarget {
    /// The null name; stores are discarded.
    Null,
    /// The debug output object.
    Debug,
    /// Local slot of the current frame.
    Local(usize),
    /// Argument slot of the current frame.
    Arg(usize),
    /// Named node.
    Node(NodeRef),
    /// Cell produced by a reference-type expression (`Index`, `RefOf`,
    /// `DerefOf`) in target position.
    Ref(ObjectRef),
}

/// What to do when an in-flight opcode's operands are complete.
#[derive(Debug)]
pub(crate) enum Pending {
    /// Schema-driven expression or statement.
    Op(Opcode),
    /// Method invocation; operands are the call arguments.
    Call {
        /// The method's node, used as the body's enclosing scope.
        node: NodeRef,
        /// Resolved method body; survives node object replacement.
        method: Arc<Method>,
    },
    /// Fixed-count package under construction.
    Package {
        /// One past the element list.
        end: usize,
        /// Declared element count.
        count: usize,
    },
    /// Runtime-sized package; the first operand is the count.
    VarPackage {
        /// One past the element list.
        end: usize,
    },
    /// Buffer under construction; the operand is the size.
    Buffer {
        /// One past the byte initializer.
        end: usize,
    },
    /// `Name` declaration waiting for its initial value.
    NameDecl {
        /// Name to install.
        name: AmlName,
    },
    /// `OperationRegion` waiting for offset and length.
    OpRegionDecl {
        /// Name to install.
        name: AmlName,
        /// Raw space byte.
        space: u8,
    },
    /// `BankField` waiting for the bank value.
    BankFieldDecl {
        /// Backing region name.
        region: AmlName,
        /// Bank selection field name.
        bank: AmlName,
        /// One past the field list.
        end: usize,
    },
    /// `DataTableRegion` waiting for its three signature strings.
    DataRegionDecl {
        /// Name to install.
        name: AmlName,
    },
    /// `If` waiting for its predicate.
    If {
        /// One past the conditional body.
        end: usize,
    },
    /// `While` waiting for its predicate (initial entry or re-arm).
    While {
        /// One past the loop body.
        end: usize,
    },
}

/// An opcode whose operands are still being produced.
#[derive(Debug)]
pub(crate) struct InFlight {
    /// Completion action.
    pub kind: Pending,
    /// Operands accumulated so far.
    pub operands: Vec<Operand>,
}

impl InFlight {
    pub(crate) fn new(kind: Pending) -> Self {
        Self {
            kind,
            operands: Vec::new(),
        }
    }

    /// Operand type expected next, or `None` when completion is positional
    /// (package element lists complete when the cursor hits their end).
    pub(crate) fn expected_arg(&self) -> Option<ArgType> {
        match &self.kind {
            Pending::Op(op) => op.op_info().args.get(self.operands.len()).copied(),
            Pending::Call { method, .. } => {
                (self.operands.len() < method.arg_count as usize).then_some(ArgType::TermArg)
            }
            Pending::Package { .. } | Pending::VarPackage { .. } => None,
            Pending::Buffer { .. } | Pending::NameDecl { .. } => {
                self.operands.is_empty().then_some(ArgType::TermArg)
            }
            Pending::OpRegionDecl { .. } => {
                (self.operands.len() < 2).then_some(ArgType::TermArg)
            }
            Pending::BankFieldDecl { .. } => {
                self.operands.is_empty().then_some(ArgType::TermArg)
            }
            Pending::DataRegionDecl { .. } => {
                (self.operands.len() < 3).then_some(ArgType::TermArg)
            }
            Pending::If { .. } | Pending::While { .. } => {
                self.operands.is_empty().then_some(ArgType::TermArg)
            }
        }
    }

    /// Whether all operands are in, given the current cursor.
    pub(crate) fn ready(&self, pc: usize) -> bool {
        match &self.kind {
            Pending::Op(op) => self.operands.len() == op.op_info().args.len(),
            Pending::Call { method, .. } => self.operands.len() == method.arg_count as usize,
            Pending::Package { end, .. } | Pending::VarPackage { end } => pc >= *end,
            Pending::Buffer { .. } | Pending::NameDecl { .. } => self.operands.len() == 1,
            Pending::OpRegionDecl { .. } => self.operands.len() == 2,
            Pending::BankFieldDecl { .. } => self.operands.len() == 1,
            Pending::DataRegionDecl { .. } => self.operands.len() == 3,
            Pending::If { .. } | Pending::While { .. } => self.operands.len() == 1,
        }
    }

    /// Whether names in term position resolve to references instead of
    /// invocations and reads (package element semantics). The count
    /// operand of a `VarPackage` is an ordinary term.
    pub(crate) fn wants_element(&self) -> bool {
        match self.kind {
            Pending::Package { .. } => true,
            Pending::VarPackage { .. } => !self.operands.is_empty(),
            _ => false,
        }
    }
}

/// Structural block within a frame.
#[derive(Debug)]
pub(crate) enum Block {
    /// `Scope`/`Device`/... body; restores the previous scope on close.
    Scope {
        /// One past the body.
        end: usize,
        /// Scope to restore.
        prev_scope: NodeRef,
    },
    /// Taken `If` body.
    If {
        /// One past the body.
        end: usize,
    },
    /// Taken `Else` body.
    Else {
        /// One past the body.
        end: usize,
    },
    /// Running `While` body.
    While {
        /// Offset of the predicate.
        start: usize,
        /// One past the body.
        end: usize,
        /// First entry, for the loop budget.
        entered: Instant,
    },
}

impl Block {
    pub(crate) fn end(&self) -> usize {
        match self {
            Block::Scope { end, .. }
            | Block::If { end }
            | Block::Else { end }
            | Block::While { end, .. } => *end,
        }
    }
}

/// A mutex held by a frame, released automatically at frame exit.
#[derive(Debug)]
pub(crate) enum HeldMutex {
    /// Ordinary AML mutex.
    Aml(Arc<crate::sync::AmlMutex>),
    /// The firmware global lock.
    Global,
}

/// What kind of evaluation a frame is.
pub(crate) enum FrameKind {
    /// Method invocation.
    Method {
        /// Whether this frame owns a nesting level of the method guard.
        serialized: Option<Arc<Method>>,
    },
    /// Top-level run of a table's AML (`Load`, `LoadTable`, initial load).
    TableLoad {
        /// The table being run.
        table: Arc<Table>,
        /// Where the caller wants the table handle stored.
        handle_target: Option<SuperTarget>,
        /// `LoadTable` parameter store, applied after the load.
        param: Option<(AmlName, ObjectRef)>,
    },
}

/// One entry of the heap-backed frame chain.
pub(crate) struct Frame {
    /// Backing table image.
    pub data: Arc<Vec<u8>>,
    /// Bytecode cursor, absolute within `data`.
    pub pc: usize,
    /// One past the frame's bytecode window.
    pub end: usize,
    /// Current namespace scope.
    pub scope: NodeRef,
    /// Local slots; each is a shared cell.
    pub locals: Vec<ObjectRef>,
    /// Argument slots.
    pub args: Vec<ObjectRef>,
    /// Pending-operand stack.
    pub ops: Vec<InFlight>,
    /// Structural block stack.
    pub blocks: Vec<Block>,
    /// Nodes created by this frame, unlinked at method return.
    pub created: Vec<NodeRef>,
    /// Mutexes to release at frame exit, in acquisition order.
    pub held: Vec<HeldMutex>,
    /// Frame flavor.
    pub kind: FrameKind,
    /// Integer width for this frame's arithmetic.
    pub width: IntegerWidth,
    /// Owner id stamped on created nodes.
    pub owner: u32,
}

impl Frame {
    /// End of the innermost block, or of the frame.
    pub(crate) fn current_end(&self) -> usize {
        self.blocks.last().map(Block::end).unwrap_or(self.end)
    }

    /// The innermost in-flight op's next expected operand type.
    pub(crate) fn expected_arg(&self) -> Option<ArgType> {
        self.ops.last().and_then(InFlight::expected_arg)
    }

    /// Whether decode is producing package elements.
    pub(crate) fn in_package(&self) -> bool {
        self.ops.last().map(InFlight::wants_element).unwrap_or(false)
    }

    /// Deliver a produced value to the innermost in-flight op, or discard
    /// it at statement level.
    pub(crate) fn deliver(&mut self, operand: Operand) {
        if let Some(op) = self.ops.last_mut() {
            op.operands.push(operand);
        }
    }
}
