//! Per-pixel image expression compiler.
//!
//! A textual arithmetic expression over pixel coordinates, input samples
//! and image statistics is parsed, lowered into a hash-consed DAG of
//! typed primitive operations, hoisted to the outermost loop level at
//! which each value is invariant, register-allocated over the x86-64
//! file, and emitted as machine code that sweeps the image with packed
//! single-precision SIMD in the inner loop.
//!
//! [`compile_eval`] is the sole entry point; the finished routine is
//! written out as a COFF object by [`pixeljit_asm::Assembler::write_object`].

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod ast;
pub mod codegen;
pub mod error;
pub mod image;
pub mod interp;
pub mod ir;
pub mod lower;
pub mod parser;
pub mod regalloc;
pub mod stats;

#[cfg(feature = "test-helpers")]
pub mod sim;

use pixeljit_asm::Assembler;
use tracing::debug;

use crate::codegen::CodeGen;
use crate::error::CompileError;
use crate::image::ImageView;
use crate::ir::{Dag, NodeId, Op, Ty};
use crate::regalloc::Schedule;
use crate::stats::Stats;

/// Everything a compilation leaves behind besides the code bytes: the
/// optimised DAG, the per-channel roots, the evaluation schedule, and
/// the diagnostics surfaced while emitting.
#[derive(Debug)]
pub struct CompileReport {
    /// The hash-consed operation DAG after cleanup.
    pub dag: Dag,
    /// One specialised root per output channel.
    pub roots: Vec<NodeId>,
    /// Per-level evaluation order and register masks.
    pub schedule: Schedule,
    /// Bytes of machine code emitted.
    pub code_len: usize,
    /// Opcodes the emitter declared but does not implement; each entry
    /// was reported with a `warn` diagnostic and produced no instruction.
    pub unsupported: Vec<&'static str>,
}

/// Compile `expression` into `asm` as a routine that evaluates it at
/// every pixel of `input` and stores the results into `output`.
///
/// The emitted routine follows the documented register convention: the
/// x/y/t/c counters live in rax/rcx/r8/rsi, the input and output base
/// pointers arrive in rdx and rdi, and r15, xmm14 and xmm15 are scratch.
pub fn compile_eval(
    asm: &mut Assembler,
    input: &ImageView<'_>,
    output: &ImageView<'_>,
    expression: &str,
) -> Result<CompileReport, CompileError> {
    check_shapes(input, output)?;

    let expr = parser::parse(expression)?;
    let stats = Stats::new(input);

    // Lowering folds statistics to literals and leaves the DAG in
    // canonical form; the final rebalance-and-sweep runs afterwards.
    let mut dag = Dag::new();
    let root = lower::lower(&mut dag, input, &stats, &expr)?;
    let root = dag.coerce(root, Ty::Float)?;
    let root = dag.cleanup(root)?;

    // The loop counters occupy their ABI registers before allocation.
    dag.preassign_var(Op::VarX, regalloc::REG_X);
    dag.preassign_var(Op::VarY, regalloc::REG_Y);
    dag.preassign_var(Op::VarT, regalloc::REG_T);
    dag.preassign_var(Op::VarC, regalloc::REG_C);

    // One specialised copy of the expression per output channel.
    let roots = (0..output.channels)
        .map(|ch| dag.substitute(root, Op::VarC, ch as i32))
        .collect::<Result<Vec<_>, _>>()?;

    let schedule = regalloc::assign_registers(&mut dag, &roots)?;
    log_schedule(&dag, &schedule);

    let mut gen = CodeGen::new(asm, &dag, input, output);
    gen.emit_program(&schedule, &roots)?;
    let unsupported = gen.into_unsupported();
    asm.finalize()?;

    Ok(CompileReport {
        code_len: asm.len(),
        dag,
        roots,
        schedule,
        unsupported,
    })
}

fn check_shapes(input: &ImageView<'_>, output: &ImageView<'_>) -> Result<(), CompileError> {
    if input.channels != 3 {
        return Err(CompileError::Shape(format!(
            "input must have 3 channels, got {}",
            input.channels
        )));
    }
    if input.width % 4 != 0 {
        return Err(CompileError::Shape(format!(
            "width must be a multiple of 4, got {}",
            input.width
        )));
    }
    if output.width != input.width
        || output.height != input.height
        || output.frames != input.frames
        || output.channels != input.channels
    {
        return Err(CompileError::Shape(
            "output dimensions must match the input".to_string(),
        ));
    }
    // The transpose epilogue stores interleaved channel blocks.
    if output.cstride != 1 || output.xstride != output.channels {
        return Err(CompileError::Shape(
            "output must be densely interleaved (cstride 1, xstride = channels)".to_string(),
        ));
    }
    Ok(())
}

fn log_schedule(dag: &Dag, schedule: &Schedule) {
    const DIMS: [char; 4] = ['t', 'y', 'x', 'c'];
    for level in 0..5 {
        if level > 0 {
            debug!("for {}:", DIMS[level - 1]);
        }
        for &id in &schedule.order[level] {
            debug!("  {}", dag.describe(id));
        }
        if schedule.clobbered[level] != 0 {
            debug!("  clobbered: {:#010x}", schedule.clobbered[level]);
        }
        if schedule.outputs[level] != 0 {
            debug!("  outputs: {:#010x}", schedule.outputs[level]);
        }
    }
}

/// Convenient single-import surface.
pub mod prelude {
    #[doc(no_inline)]
    pub use pixeljit_asm::{Assembler, Mem, RegId, XmmId};

    pub use crate::ast::{BinOp, CmpFn, Expr, StatFn, UnaryFn};
    pub use crate::error::CompileError;
    pub use crate::image::{ImageBuf, ImageView};
    pub use crate::interp::Interpreter;
    pub use crate::ir::{Dag, Deps, NodeId, Op, Ty};
    pub use crate::regalloc::Schedule;
    pub use crate::stats::Stats;
    pub use crate::{compile_eval, CompileReport};
}
