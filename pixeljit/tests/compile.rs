//! End-to-end compilation scenarios: the schedule produced by a full
//! compile is executed by the simulator and held against the reference
//! interpreter.

use pixeljit::prelude::*;
use pixeljit::sim;

// 4x2x1x3 ramp: input(x, y, t, c) = 10x + y + 0.1c
fn ramp() -> ImageBuf {
    let mut im = ImageBuf::new(4, 2, 1, 3);
    im.fill_with(|x, y, _, c| 10.0 * x as f32 + y as f32 + 0.1 * c as f32);
    im
}

fn compile(expression: &str, input: &ImageBuf) -> (Assembler, CompileReport) {
    let mut out = ImageBuf::new(4, 2, 1, 3);
    compile_sized(expression, input, &mut out)
}

fn compile_sized(
    expression: &str,
    input: &ImageBuf,
    out: &mut ImageBuf,
) -> (Assembler, CompileReport) {
    let mut asm = Assembler::new();
    let report = compile_eval(&mut asm, &input.view(), &out.view(), expression)
        .expect("compilation failed");
    (asm, report)
}

fn run(expression: &str, input: &ImageBuf) -> ImageBuf {
    let mut out = ImageBuf::new(4, 2, 1, 3);
    let (_, report) = compile_sized(expression, input, &mut out);
    sim::run(
        &report.dag,
        &report.schedule,
        &report.roots,
        input.view(),
        &mut out,
    );
    out
}

#[test]
fn x_plus_one_writes_the_column_ramp() {
    let input = ramp();
    let out = run("x + 1", &input);
    for y in 0..2 {
        for x in 0..4 {
            for c in 0..3 {
                assert_eq!(out.at(x, y, 0, c), (x + 1) as f32, "({x},{y},{c})");
            }
        }
    }
}

#[test]
fn val_times_two_doubles_every_sample() {
    let input = ramp();
    let out = run("val * 2", &input);
    for y in 0..2 {
        for x in 0..4 {
            for c in 0..3 {
                assert_eq!(out.at(x, y, 0, c), 2.0 * input.at(x, y, 0, c));
            }
        }
    }
}

#[test]
fn ternary_on_x_produces_the_step_mask() {
    let input = ramp();
    let out = run("(x > 1) ? 1 : 0", &input);
    for y in 0..2 {
        for x in 0..4 {
            for c in 0..3 {
                let expect = if x > 1 { 1.0 } else { 0.0 };
                assert_eq!(out.at(x, y, 0, c), expect, "({x},{y},{c})");
            }
        }
    }
}

#[test]
fn integer_resample_reproduces_the_input() {
    let input = ramp();
    let out = run("[x, y]", &input);
    for y in 0..2 {
        for x in 0..4 {
            for c in 0..3 {
                assert_eq!(out.at(x, y, 0, c), input.at(x, y, 0, c), "({x},{y},{c})");
            }
        }
    }
}

#[test]
fn mean_is_bit_identical_across_pixels() {
    let input = ramp();
    let expected = Stats::new(&input.view()).mean();
    let out = run("mean()", &input);
    for y in 0..2 {
        for x in 0..4 {
            for c in 0..3 {
                assert_eq!(out.at(x, y, 0, c).to_bits(), expected.to_bits());
            }
        }
    }
}

#[test]
fn transcendentals_surface_diagnostics_without_crashing() {
    let input = ramp();
    let (_, report) = compile("sin(x) + cos(y)", &input);
    assert!(report.unsupported.contains(&"Sin"));
    assert!(report.unsupported.contains(&"Cos"));
    assert!(report.code_len > 0);
}

#[test]
fn zero_body_writes_zero_everywhere() {
    let input = ramp();
    let out = run("0", &input);
    for y in 0..2 {
        for x in 0..4 {
            for c in 0..3 {
                assert_eq!(out.at(x, y, 0, c), 0.0);
            }
        }
    }
}

#[test]
fn bare_x_writes_the_column_index() {
    let input = ramp();
    let out = run("x", &input);
    for y in 0..2 {
        for x in 0..4 {
            assert_eq!(out.at(x, y, 0, 1), x as f32);
        }
    }
}

#[test]
fn width_not_a_multiple_of_four_is_rejected() {
    let mut input = ImageBuf::new(5, 2, 1, 3);
    input.fill_with(|x, _, _, _| x as f32);
    let out = ImageBuf::new(5, 2, 1, 3);
    let mut asm = Assembler::new();
    let err = compile_eval(&mut asm, &input.view(), &out.view(), "x").unwrap_err();
    assert!(matches!(err, CompileError::Shape(_)), "{err}");
}

#[test]
fn channel_counts_other_than_three_are_rejected() {
    let input = ImageBuf::new(4, 2, 1, 2);
    let out = ImageBuf::new(4, 2, 1, 2);
    let mut asm = Assembler::new();
    let err = compile_eval(&mut asm, &input.view(), &out.view(), "x").unwrap_err();
    assert!(matches!(err, CompileError::Shape(_)), "{err}");
}

#[test]
fn mismatched_output_dimensions_are_rejected() {
    let input = ramp();
    let out = ImageBuf::new(8, 2, 1, 3);
    let mut asm = Assembler::new();
    let err = compile_eval(&mut asm, &input.view(), &out.view(), "x").unwrap_err();
    assert!(matches!(err, CompileError::Shape(_)));
}

#[test]
fn unknown_identifiers_abort_with_a_position() {
    let input = ramp();
    let out = ImageBuf::new(4, 2, 1, 3);
    let mut asm = Assembler::new();
    let err = compile_eval(&mut asm, &input.view(), &out.view(), "x + blue").unwrap_err();
    assert!(matches!(err, CompileError::Parse { pos: 4, .. }), "{err}");
}

// The compiled schedule must agree with the tree-walking interpreter at
// every pixel for expressions in the implemented subset.
#[test]
fn compiled_matches_interpreted_on_a_corpus() {
    let corpus = [
        "x + y * 2 - 1",
        "val / 2 + x",
        "x / 2",
        "(x > y) ? val : 0 - val",
        "(x == y) ? 100 : val",
        "mean() + val - x",
        "val - mean()",
        "[x, y] + [0]",
        "width + height + x",
        "covariance(0, 1) + x",
        "max() - val",
        "stddev(1) + y",
        "-x + val",
        "(x >= 2) ? (y < 1 ? 1 : 2) : 3",
    ];
    let input = ramp();
    let interp = Interpreter::new(input.view());

    for expression in corpus {
        let out = run(expression, &input);
        let ast = pixeljit::parser::parse(expression).unwrap();
        for y in 0..2 {
            for x in 0..4 {
                for c in 0..3 {
                    let want = interp.eval(&ast, x, y, 0, c);
                    let got = out.at(x, y, 0, c);
                    let tolerance = 1e-4 * want.abs().max(1.0);
                    assert!(
                        (got - want).abs() <= tolerance,
                        "`{expression}` at ({x},{y},{c}): compiled {got}, interpreted {want}"
                    );
                }
            }
        }
    }
}

// A second frame exercises the t loop and the t term of the load
// address arithmetic.
#[test]
fn multi_frame_images_agree_with_the_interpreter() {
    let mut input = ImageBuf::new(8, 4, 2, 3);
    input.fill_with(|x, y, t, c| {
        100.0 * t as f32 + 10.0 * x as f32 + y as f32 + 0.1 * c as f32
    });
    let mut out = ImageBuf::new(8, 4, 2, 3);
    let interp = Interpreter::new(input.view());

    for expression in ["val + t", "t * 100 + x", "(t > 0) ? val : 0 - 1"] {
        let mut asm = Assembler::new();
        let report = compile_eval(&mut asm, &input.view(), &out.view(), expression)
            .expect("compilation failed");
        sim::run(
            &report.dag,
            &report.schedule,
            &report.roots,
            input.view(),
            &mut out,
        );
        let ast = pixeljit::parser::parse(expression).unwrap();
        for t in 0..2 {
            for y in 0..4 {
                for x in 0..8 {
                    for c in 0..3 {
                        let want = interp.eval(&ast, x, y, t, c);
                        let got = out.at(x, y, t, c);
                        assert!(
                            (got - want).abs() <= 1e-3,
                            "`{expression}` at ({x},{y},{t},{c}): {got} vs {want}"
                        );
                    }
                }
            }
        }
    }
}

// Structural invariants of the allocator's schedule.
#[test]
fn schedules_respect_ordering_banks_and_reservations() {
    use std::collections::HashSet;

    let input = ramp();
    for expression in ["(x > 1) ? val : mean()", "val * 2 + x / 4 - y"] {
        let (_, report) = compile(expression, &input);
        let dag = &report.dag;

        let mut emitted: HashSet<NodeId> = HashSet::new();
        for level in 0..5 {
            for &id in &report.schedule.order[level] {
                let node = dag.node(id);
                assert_eq!(node.level as usize, level, "node scheduled at its level");

                let reg = node.reg.expect("scheduled node has a register");
                assert_eq!(
                    pixeljit::regalloc::RESERVED & (1 << reg),
                    0,
                    "allocation avoided the reserved file"
                );
                match node.ty {
                    Ty::Int => assert!(reg < 16, "integers live in GPRs"),
                    _ => assert!(reg >= 16, "floats and masks live in SSE registers"),
                }

                for &input_id in &dag.node(id).inputs {
                    let ready = emitted.contains(&input_id)
                        || matches!(
                            dag.node(input_id).op,
                            Op::VarX | Op::VarY | Op::VarT | Op::VarC
                        );
                    assert!(ready, "inputs are emitted before their consumers");
                }
                emitted.insert(id);
            }
        }
    }
}

#[test]
fn the_object_file_is_written_with_the_routine_symbol() {
    let input = ramp();
    let (asm, report) = compile("val * 2", &input);
    assert_eq!(report.code_len, asm.len());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eval.obj");
    asm.write_object(&path, "pixel_eval").unwrap();
    let bytes = std::fs::read(&path).unwrap();
    // AMD64 COFF magic
    assert_eq!(&bytes[..2], &[0x64, 0x86]);
    assert!(bytes.len() > report.code_len);
}

#[test]
fn consecutive_compilations_use_fresh_arenas() {
    let input = ramp();
    let first = run("x + 1", &input);
    let second = run("val * 2", &input);
    assert_eq!(first.at(3, 0, 0, 0), 4.0);
    assert_eq!(second.at(3, 0, 0, 0), 2.0 * input.at(3, 0, 0, 0));
}
