//! [`Interpreter`] implementation
//!
//! The executor is iterative: one driver loop works through the current
//! frame's pending-operand stack and bytecode cursor, so host stack usage
//! is constant no matter how deeply methods call methods or `Load` nests
//! table loads. Method calls and table loads push frames onto a heap-backed
//! chain; aborts unwind every frame back to the evaluate-entry call.

use crate::context::Context;
use crate::error::{AbortResult, AmlError, MethodAbort};
use crate::name::AmlName;
use crate::namespace::NodeRef;
use crate::object::{
    IntegerWidth, Method, MethodBody, NativeMethod, Object, ObjectRef,
};
use crate::opregion::field_read;
use crate::table::Table;

use std::sync::Arc;

use tracing::{debug, trace, warn};

mod decode;
mod exec;
mod frame;
mod store;

pub(crate) use frame::{Block, Frame, FrameKind, HeldMutex, InFlight, Operand, Pending, SuperTarget};

/// AML bytecode interpreter.
///
/// One instance drives one evaluation at a time; concurrency comes from
/// running multiple interpreters against the shared [`Context`]. The
/// internal frame chain is heap-backed, which is what makes `Load` nesting
/// and deep call chains safe on tiny kernel stacks.
pub struct Interpreter {
    ctx: Arc<Context>,
    frames: Vec<Frame>,
    final_result: Option<ObjectRef>,
}

impl Interpreter {
    /// New interpreter over the shared context.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            frames: Vec::new(),
            final_result: None,
        }
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Evaluate the object at `path` with plain-data arguments.
    ///
    /// Methods are invoked; field units are read; anything else yields the
    /// object itself. `None` means the method returned nothing.
    pub fn evaluate_path(
        &mut self,
        path: &str,
        args: Vec<Object>,
    ) -> Result<Option<ObjectRef>, AmlError> {
        let name: AmlName = path.parse()?;
        let node = self
            .ctx
            .namespace()
            .find(self.ctx.namespace().root(), &name)?;
        self.evaluate_node(&node, args.into_iter().map(ObjectRef::new).collect())
    }

    /// Evaluate `node` with already-boxed arguments.
    pub fn evaluate_node(
        &mut self,
        node: &NodeRef,
        args: Vec<ObjectRef>,
    ) -> Result<Option<ObjectRef>, AmlError> {
        let object = node.object();
        let method = match &*object.read() {
            Object::Method(method) => method.clone(),
            Object::FieldUnit(unit) => {
                let unit = unit.clone();
                let value = field_read(&self.ctx, &unit, IntegerWidth::Full)
                    .map_err(MethodAbort::into_client)?;
                return Ok(Some(ObjectRef::new(value)));
            }
            Object::BufferField(field) => {
                let field = field.clone();
                let value =
                    store::buffer_field_read(&field, IntegerWidth::Full).map_err(MethodAbort::into_client)?;
                return Ok(Some(ObjectRef::new(value)));
            }
            _ => return Ok(Some(object.clone())),
        };

        match &method.body {
            MethodBody::Native(native) => {
                let result = self.run_native(*native, &args)?;
                Ok(Some(result))
            }
            MethodBody::Aml(_) => {
                debug!(
                    target: "aml_vm::interpreter",
                    method = %node.absolute_path(),
                    args = args.len(),
                    "evaluating method"
                );
                self.push_method_frame(node.clone(), method, args)
                    .map_err(MethodAbort::into_client)?;
                self.run()
            }
        }
    }

    /// Run a table's top level, populating the namespace.
    pub fn load_table(&mut self, table: &Arc<Table>) -> Result<(), AmlError> {
        if table.is_loaded() {
            return Ok(());
        }
        if !self.frames.is_empty() {
            return Err(AmlError::InvalidArgument("interpreter is mid-evaluation"));
        }
        self.push_table_frame(table.clone(), None, None, None)
            .map_err(MethodAbort::into_client)?;
        self.run().map(|_| ())
    }

    pub(crate) fn run_native(
        &mut self,
        native: NativeMethod,
        args: &[ObjectRef],
    ) -> Result<ObjectRef, AmlError> {
        match native {
            NativeMethod::OsiQuery => {
                let question = args
                    .first()
                    .ok_or(AmlError::BadOperand("_OSI needs one argument"))?;
                let answer = {
                    let guard = question.read();
                    match &*guard {
                        Object::String(bytes) => {
                            let text = String::from_utf8_lossy(bytes);
                            self.ctx.has_interface(&text)
                        }
                        _ => false,
                    }
                };
                let value = if answer { u64::MAX } else { 0 };
                Ok(ObjectRef::new(Object::Integer(value)))
            }
        }
    }

    /* DRIVER */

    fn run(&mut self) -> Result<Option<ObjectRef>, AmlError> {
        self.final_result = None;
        while !self.frames.is_empty() {
            if let Err(abort) = self.step() {
                warn!(target: "aml_vm::interpreter", error = %abort, "method aborted");
                self.unwind_all();
                return Err(abort.into_client());
            }
        }
        Ok(self.final_result.take())
    }

    fn step(&mut self) -> AbortResult<()> {
        let frame = self.top_mut()?;

        // Re-enter the innermost opcode once its operands are complete.
        let pc = frame.pc;
        if frame.ops.last().map(|op| op.ready(pc)).unwrap_or(false) {
            let inflight = frame
                .ops
                .pop()
                .ok_or(MethodAbort::Error(AmlError::BadBytecode("operand stack")))?;
            return self.execute(inflight);
        }

        // Close the innermost block, or finish the frame.
        if frame.pc >= frame.current_end() {
            if frame.blocks.is_empty() {
                return self.pop_frame(None);
            }
            return self.close_block();
        }

        self.decode_next()
    }

    pub(crate) fn top_mut(&mut self) -> AbortResult<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or(MethodAbort::Error(AmlError::BadBytecode("no active frame")))
    }

    pub(crate) fn deliver_value(&mut self, value: ObjectRef) -> AbortResult<()> {
        self.top_mut()?.deliver(Operand::Value(value));
        Ok(())
    }

    /* BLOCKS */

    fn close_block(&mut self) -> AbortResult<()> {
        let loop_budget = self.ctx.loop_timeout();
        let frame = self.top_mut()?;
        let block = frame
            .blocks
            .pop()
            .ok_or(MethodAbort::Error(AmlError::BadBytecode("block stack")))?;
        match block {
            Block::Scope { prev_scope, .. } => {
                frame.scope = prev_scope;
            }
            Block::Else { .. } => {}
            Block::If { .. } => {
                // A taken If swallows its trailing Else.
                self.skip_trailing_else()?;
            }
            Block::While {
                start,
                end,
                entered,
            } => {
                if entered.elapsed() > loop_budget {
                    return Err(MethodAbort::Error(AmlError::Timeout(loop_budget)));
                }
                frame.pc = start;
                frame.blocks.push(Block::While {
                    start,
                    end,
                    entered,
                });
                frame.ops.push(InFlight::new(Pending::While { end }));
            }
        }
        Ok(())
    }

    /* FRAMES */

    pub(crate) fn push_method_frame(
        &mut self,
        node: NodeRef,
        method: Arc<Method>,
        args: Vec<ObjectRef>,
    ) -> AbortResult<()> {
        if self.frames.len() >= self.ctx.max_call_depth() {
            return Err(MethodAbort::FrameDepth(self.ctx.max_call_depth()));
        }
        let code = match &method.body {
            MethodBody::Aml(code) => code.clone(),
            MethodBody::Native(_) => {
                return Err(MethodAbort::Error(AmlError::InvalidArgument(
                    "native methods have no frame",
                )))
            }
        };
        if args.len() != method.arg_count as usize {
            trace!(
                target: "aml_vm::interpreter",
                declared = method.arg_count,
                supplied = args.len(),
                "argument count mismatch"
            );
        }
        let serialized = if method.serialized {
            let thread = self.ctx.host().thread_id();
            method.guard.acquire(thread, None);
            Some(method.clone())
        } else {
            None
        };

        let mut arg_slots: Vec<ObjectRef> = args;
        arg_slots.truncate(crate::consts::ARG_COUNT);
        while arg_slots.len() < crate::consts::ARG_COUNT {
            arg_slots.push(ObjectRef::new(Object::Uninitialized));
        }

        self.frames.push(Frame {
            data: code.data().clone(),
            pc: code.start(),
            end: code.end(),
            scope: node,
            locals: (0..crate::consts::LOCAL_COUNT)
                .map(|_| ObjectRef::new(Object::Uninitialized))
                .collect(),
            args: arg_slots,
            ops: Vec::new(),
            blocks: Vec::new(),
            created: Vec::new(),
            held: Vec::new(),
            kind: FrameKind::Method { serialized },
            width: method.width,
            owner: crate::namespace::OWNER_CORE,
        });
        Ok(())
    }

    /// Push a table's top level as a frame on the existing chain. This is
    /// how `Load` stays O(1) on the host stack regardless of nesting.
    pub(crate) fn push_table_frame(
        &mut self,
        table: Arc<Table>,
        scope: Option<NodeRef>,
        handle_target: Option<SuperTarget>,
        param: Option<(AmlName, ObjectRef)>,
    ) -> AbortResult<()> {
        if self.frames.len() >= self.ctx.max_call_depth() {
            return Err(MethodAbort::FrameDepth(self.ctx.max_call_depth()));
        }
        let code = table.aml();
        let width = IntegerWidth::for_revision(table.header.revision);
        let owner = table.id;
        debug!(
            target: "aml_vm::interpreter",
            table = table.header.signature_str(),
            owner,
            "running table",
        );
        self.frames.push(Frame {
            data: code.data().clone(),
            pc: code.start(),
            end: code.end(),
            scope: scope.unwrap_or_else(|| self.ctx.namespace().root().clone()),
            locals: (0..crate::consts::LOCAL_COUNT)
                .map(|_| ObjectRef::new(Object::Uninitialized))
                .collect(),
            args: (0..crate::consts::ARG_COUNT)
                .map(|_| ObjectRef::new(Object::Uninitialized))
                .collect(),
            ops: Vec::new(),
            blocks: Vec::new(),
            created: Vec::new(),
            held: Vec::new(),
            kind: FrameKind::TableLoad {
                table,
                handle_target,
                param,
            },
            width,
            owner,
        });
        Ok(())
    }

    /// Pop the top frame, run its cleanup, and deliver `result` to the
    /// caller (or stash it as the final result).
    pub(crate) fn pop_frame(&mut self, result: Option<ObjectRef>) -> AbortResult<()> {
        let frame = self
            .frames
            .pop()
            .ok_or(MethodAbort::Error(AmlError::BadBytecode("frame stack")))?;
        let kind = self.cleanup_frame(frame);

        match kind {
            FrameKind::Method { .. } => {
                if self.frames.is_empty() {
                    self.final_result = result;
                } else if let Some(top) = self.frames.last_mut() {
                    if !top.ops.is_empty() {
                        let value = result
                            .unwrap_or_else(|| ObjectRef::new(Object::Uninitialized));
                        top.deliver(Operand::Value(value));
                    }
                }
            }
            FrameKind::TableLoad {
                table,
                handle_target,
                param,
            } => {
                table.mark_loaded();
                self.ctx.events().scan_gpe_methods(&self.ctx);
                if let Some((name, value)) = param {
                    let root = self.ctx.namespace().root().clone();
                    match self.ctx.namespace().find(&root, &name) {
                        Ok(node) => self.store_to_node(&node, &value, IntegerWidth::Full)?,
                        Err(error) => {
                            warn!(target: "aml_vm::interpreter", %error, "LoadTable parameter path")
                        }
                    }
                }
                let handle = ObjectRef::new(Object::Integer(table.id as u64));
                if let Some(target) = handle_target {
                    if !self.frames.is_empty() {
                        self.store_to_target(&handle, &target)?;
                    }
                }
                if !self.frames.is_empty() {
                    // Load/LoadTable in expression position evaluate to the
                    // (truthy) table handle.
                    self.deliver_value(handle)?;
                }
            }
        }
        Ok(())
    }

    /// Release everything a frame holds. Returns the kind for completion
    /// handling.
    fn cleanup_frame(&mut self, mut frame: Frame) -> FrameKind {
        let thread = self.ctx.host().thread_id();
        // Method-local named objects disappear at return; their objects
        // stay alive through any references handed out.
        if matches!(frame.kind, FrameKind::Method { .. }) {
            for node in frame.created.drain(..) {
                self.ctx.namespace().remove(&node);
            }
        }
        for held in frame.held.drain(..).rev() {
            match held {
                HeldMutex::Aml(mutex) => {
                    if mutex.guard().release(thread).is_err() {
                        warn!(target: "aml_vm::interpreter", "frame exit released unowned mutex");
                    }
                }
                HeldMutex::Global => {
                    let host = self.ctx.host();
                    if self.ctx.global_lock().release(&*host, thread).is_err() {
                        warn!(target: "aml_vm::interpreter", "frame exit released unowned global lock");
                    }
                }
            }
        }
        if let FrameKind::Method {
            serialized: Some(method),
        } = &frame.kind
        {
            if method.guard.release(thread).is_err() {
                warn!(target: "aml_vm::interpreter", "serialized guard release failed");
            }
        }
        frame.kind
    }

    fn unwind_all(&mut self) {
        while let Some(frame) = self.frames.pop() {
            self.cleanup_frame(frame);
        }
    }

    /// Highest sync level currently held by any frame of this evaluation.
    pub(crate) fn current_sync_level(&self) -> Option<u8> {
        self.frames
            .iter()
            .flat_map(|frame| {
                let held = frame.held.iter().filter_map(|held| match held {
                    HeldMutex::Aml(mutex) => Some(mutex.sync_level()),
                    HeldMutex::Global => Some(0),
                });
                let serialized = match &frame.kind {
                    FrameKind::Method {
                        serialized: Some(method),
                    } => Some(method.sync_level),
                    _ => None,
                };
                held.chain(serialized)
            })
            .max()
    }
}
