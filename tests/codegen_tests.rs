//! End-to-end lowering tests.
//!
//! Each test builds a small IR program plus an allocation oracle, lowers it
//! to text, and asserts on the emitted assembly: frame shape, parameter
//! placement, call safety, flags fusion, division around the fixed register
//! pair, and operand determinism.

use x64gen::ir::{Block, DataItem, IrInst, IrValue, Method, Program};
use x64gen::x64::regs::Reg;
use x64gen::{generate_assembly, AllocationMap};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pos(text: &str, needle: &str) -> usize {
    match text.find(needle) {
        Some(p) => p,
        None => panic!("missing {needle:?} in:\n{text}"),
    }
}

fn main_with(insts: Vec<IrInst>) -> Program {
    Program::new(vec![], vec![Method::new("main", vec![], vec![Block::entry(insts)])])
}

#[test]
fn test_empty_main_frame_shape() {
    init_logs();
    let program = main_with(vec![IrInst::Return(Some(IrValue::int(0)))]);
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();

    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        vec![
            ".data",
            "",
            ".text",
            ".global _main",
            ".p2align  4, 0x90",
            "_main:",
            "\tpushq\t%rbp",
            "\tmovq\t%rsp, %rbp",
            "\tpushq\t%r15",
            "\tpushq\t%r14",
            "\tpushq\t%r13",
            "\tpushq\t%r12",
            "\tsubq\t$0, %rsp",
            "\tmovq\t$0, %rax",
            "\txorl\t%eax, %eax",
            "\taddq\t$0, %rsp",
            "\tpopq\t%r12",
            "\tpopq\t%r13",
            "\tpopq\t%r14",
            "\tpopq\t%r15",
            "\tmovq\t%rbp, %rsp",
            "\tpopq\t%rbp",
            "\tretq",
            ".subsections_via_symbols",
        ]
    );
}

#[test]
fn test_frame_round_trip_cancels() {
    // No calls, no spills: the decrement and increment match exactly.
    let program = main_with(vec![IrInst::Return(Some(IrValue::int(0)))]);
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();
    assert!(text.contains("\tsubq\t$0, %rsp"));
    assert!(text.contains("\taddq\t$0, %rsp"));
}

#[test]
fn test_frame_size_is_rounded_magnitude() {
    // Two spilled temporaries: 16 bytes, already aligned; three would
    // round to 32.
    let program = main_with(vec![
        IrInst::Copy { src: IrValue::int(1), dest: IrValue::reg("t0") },
        IrInst::Copy { src: IrValue::int(2), dest: IrValue::reg("t1") },
        IrInst::Copy { src: IrValue::int(3), dest: IrValue::reg("t2") },
        IrInst::Return(None),
    ]);
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();
    assert!(text.contains("\tsubq\t$32, %rsp"));
    assert!(text.contains("\taddq\t$32, %rsp"));
}

#[test]
fn test_eight_parameters_enter_from_registers_and_caller_frame() {
    init_logs();
    let params: Vec<IrValue> =
        ["a", "b", "c", "d", "e", "f", "g", "h"].iter().map(|p| IrValue::reg(p)).collect();
    let mut oracle = AllocationMap::new();
    for (param, reg) in params.iter().take(5).zip([Reg::R11, Reg::R12, Reg::R13, Reg::R14, Reg::R15])
    {
        oracle.assign("callee", param.clone(), reg);
    }
    let program = Program::new(
        vec![],
        vec![Method::new(
            "callee",
            params,
            vec![Block::entry(vec![IrInst::Return(None)])],
        )],
    );
    let text = generate_assembly(&program, &oracle).unwrap();

    // Register-passed parameters move from their argument registers.
    assert!(text.contains("\tmovq\t%rdi, %r11"));
    assert!(text.contains("\tmovq\t%rsi, %r12"));
    assert!(text.contains("\tmovq\t%r8, %r15"));
    // The sixth parameter was never placed; it parks in a spill slot.
    assert!(text.contains("\tmovq\t%r9, -8(%rbp)"));
    // Parameters 7 and 8 come out of the caller frame, through scratch.
    assert!(text.contains("\tmovq\t16(%rbp), %r10"));
    assert!(text.contains("\tmovq\t24(%rbp), %r10"));
    assert!(text.contains("callee:"));
}

#[test]
fn test_comparison_and_branch_fuse_to_one_cmp() {
    let mut oracle = AllocationMap::new();
    oracle.assign("check", IrValue::reg("x"), Reg::Rcx);
    let program = Program::new(
        vec![],
        vec![Method::new(
            "check",
            vec![IrValue::reg("x")],
            vec![
                Block::entry(vec![
                    IrInst::Binary {
                        op: x64gen::ir::BinOp::Gt,
                        lhs: IrValue::reg("x"),
                        rhs: IrValue::int(3),
                        dest: IrValue::reg("t"),
                    },
                    IrInst::CondBranch { condition: IrValue::reg("t"), target: "else_0".to_string() },
                ]),
                Block::named("else_0", vec![IrInst::Return(None)]),
            ],
        )],
    );
    let text = generate_assembly(&program, &oracle).unwrap();

    // Exactly one comparison; the branch reuses its flags, negated.
    assert_eq!(text.matches("cmpq").count(), 1);
    assert!(text.contains("\tcmpq\t$3, %r10"));
    assert!(text.contains("\tsetg\t%al"));
    assert!(text.contains("\tmovzbq\t%al, %r10"));
    assert!(text.contains("\tjle\t.else_0"));
    assert!(text.contains(".else_0:"));
}

#[test]
fn test_unfused_branch_compares_against_zero() {
    let program = Program::new(
        vec![],
        vec![Method::new(
            "walk",
            vec![IrValue::reg("y")],
            vec![
                Block::entry(vec![IrInst::CondBranch {
                    condition: IrValue::reg("y"),
                    target: "end".to_string(),
                }]),
                Block::named("end", vec![IrInst::Return(None)]),
            ],
        )],
    );
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();
    assert!(text.contains("\tcmpq\t$0, -8(%rbp)"));
    assert!(text.contains("\tje\t.end"));
}

#[test]
fn test_constant_branch_condition_stages_through_scratch() {
    let program = Program::new(
        vec![],
        vec![Method::new(
            "always",
            vec![],
            vec![
                Block::entry(vec![IrInst::CondBranch {
                    condition: IrValue::int(1),
                    target: "end".to_string(),
                }]),
                Block::named("end", vec![IrInst::Return(None)]),
            ],
        )],
    );
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();
    assert!(text.contains("\tmovq\t$1, %r10"));
    assert!(text.contains("\tcmpq\t$0, %r10"));
    assert!(text.contains("\tje\t.end"));
}

#[test]
fn test_comparison_without_branch_materializes() {
    // The 0/1 result must land in the destination even when nothing
    // branches on it.
    let program = main_with(vec![
        IrInst::Binary {
            op: x64gen::ir::BinOp::Eq,
            lhs: IrValue::int(1),
            rhs: IrValue::int(2),
            dest: IrValue::reg("t"),
        },
        IrInst::Return(None),
    ]);
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();
    assert!(text.contains("\tsete\t%al"));
    assert!(text.contains("\tmovzbq\t%al, %r10"));
    assert!(text.contains("\tmovq\t%r10, -8(%rbp)"));
}

#[test]
fn test_call_with_eight_arguments_uses_overflow_slots() {
    let args: Vec<IrValue> = (1..=8).map(IrValue::int).collect();
    let program = main_with(vec![
        IrInst::Call {
            method: "sum8".to_string(),
            args,
            dest: Some(IrValue::reg("t")),
            external: false,
        },
        IrInst::Return(None),
    ]);
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();

    // 2 overflow words round up to 16 bytes, reserved then released.
    assert!(text.contains("\tsubq\t$16, %rsp"));
    assert!(text.contains("\tmovq\t$7, (%rsp)"));
    assert!(text.contains("\tmovq\t$8, 8(%rsp)"));
    assert!(text.contains("\taddq\t$16, %rsp"));
    assert!(text.contains("\tcallq\tsum8"));
    // Register arguments are written in reverse order.
    assert!(pos(&text, "movq\t$6, %r9") < pos(&text, "movq\t$1, %rdi"));
    // The result comes out of rax after the call.
    assert!(pos(&text, "callq\tsum8") < pos(&text, "movq\t%rax, -8(%rbp)"));
    // The overflow release happens after the result move.
    assert!(pos(&text, "movq\t%rax, -8(%rbp)") < pos(&text, "addq\t$16, %rsp"));
}

#[test]
fn test_call_argument_collision_is_staged() {
    init_logs();
    // swap-shaped call: f(a, b) calls g(b, a) with b living in rsi, the
    // destination of the second argument.
    let mut oracle = AllocationMap::new();
    oracle.assign("f", IrValue::reg("a"), Reg::R12);
    oracle.assign("f", IrValue::reg("b"), Reg::Rsi);
    let program = Program::new(
        vec![],
        vec![Method::new(
            "f",
            vec![IrValue::reg("a"), IrValue::reg("b")],
            vec![Block::entry(vec![
                IrInst::Call {
                    method: "g".to_string(),
                    args: vec![IrValue::reg("b"), IrValue::reg("a")],
                    dest: None,
                    external: false,
                },
                IrInst::Return(None),
            ])],
        )],
    );
    let text = generate_assembly(&program, &oracle).unwrap();

    // b's value parks on the stack before any destination is written...
    let park = pos(&text, "movq\t%rsi, -8(%rbp)");
    // ...the second argument writes rsi...
    let write_rsi = pos(&text, "movq\t%r12, %rsi");
    // ...and the first argument reads the parked copy, not the register.
    let load_rdi = pos(&text, "movq\t-8(%rbp), %rdi");
    assert!(park < write_rsi);
    assert!(write_rsi < load_rdi);
}

#[test]
fn test_division_preserves_remainder_register() {
    let program = Program::new(
        vec![],
        vec![Method::new(
            "f",
            vec![IrValue::reg("a"), IrValue::reg("b")],
            vec![Block::entry(vec![
                IrInst::Binary {
                    op: x64gen::ir::BinOp::Div,
                    lhs: IrValue::reg("a"),
                    rhs: IrValue::reg("b"),
                    dest: IrValue::reg("t"),
                },
                IrInst::Return(Some(IrValue::reg("t"))),
            ])],
        )],
    );
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();

    // rdx is parked before the divide and restored afterwards, around the
    // quotient move.
    let save = pos(&text, "movq\t%rdx, -32(%rbp)");
    let divide = pos(&text, "\tidivq\t-16(%rbp)");
    let result = pos(&text, "movq\t%rax, -24(%rbp)");
    let restore = pos(&text, "movq\t-32(%rbp), %rdx");
    assert!(save < divide);
    assert!(divide < result);
    assert!(result < restore);
    assert!(text.contains("\tcqto"));
}

#[test]
fn test_modulo_into_remainder_register_skips_save() {
    let mut oracle = AllocationMap::new();
    oracle.assign("f", IrValue::reg("t"), Reg::Rdx);
    let program = Program::new(
        vec![],
        vec![Method::new(
            "f",
            vec![IrValue::reg("a"), IrValue::reg("b")],
            vec![Block::entry(vec![
                IrInst::Binary {
                    op: x64gen::ir::BinOp::Mod,
                    lhs: IrValue::reg("a"),
                    rhs: IrValue::reg("b"),
                    dest: IrValue::reg("t"),
                },
                IrInst::Return(None),
            ])],
        )],
    );
    let text = generate_assembly(&program, &oracle).unwrap();

    // Destination is the remainder register itself: no park, no restore.
    assert!(!text.contains("movq\t%rdx, -"));
    assert!(text.contains("movq\t%rdx, %rdx"));
}

#[test]
fn test_constant_divisor_moves_into_scratch() {
    let program = main_with(vec![
        IrInst::Binary {
            op: x64gen::ir::BinOp::Div,
            lhs: IrValue::int(10),
            rhs: IrValue::int(3),
            dest: IrValue::reg("t"),
        },
        IrInst::Return(None),
    ]);
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();
    assert!(text.contains("\tmovq\t$3, %r10"));
    assert!(text.contains("\tidivq\t%r10"));
}

#[test]
fn test_external_call_zeroes_low_result_register() {
    let program = Program::new(
        vec![DataItem::StringConstant {
            label: "L_str0".to_string(),
            content: "hello".to_string(),
        }],
        vec![Method::new(
            "main",
            vec![],
            vec![Block::entry(vec![
                IrInst::Call {
                    method: "printf".to_string(),
                    args: vec![IrValue::string("L_str0", "hello")],
                    dest: None,
                    external: true,
                },
                IrInst::Return(None),
            ])],
        )],
    );
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();

    // String constants are passed by address.
    assert!(text.contains("\tleaq\tL_str0(%rip), %rdi"));
    let zero = pos(&text, "\txorl\t%eax, %eax");
    let call = pos(&text, "\tcallq\t_printf");
    assert!(zero < call);
    // The data section carries the constant verbatim.
    assert!(text.contains("L_str0:"));
    assert!(text.contains("\t.string \"hello\""));
}

#[test]
fn test_caller_saved_live_registers_are_preserved() {
    let mut oracle = AllocationMap::new();
    oracle.mark_live_registers("main", 0, vec![Reg::Rcx]);
    let program = main_with(vec![
        IrInst::Call {
            method: "tick".to_string(),
            args: vec![],
            dest: None,
            external: false,
        },
        IrInst::Return(None),
    ]);
    let text = generate_assembly(&program, &oracle).unwrap();

    let save = pos(&text, "movq\t%rcx, -8(%rbp)");
    let call = pos(&text, "callq\ttick");
    let restore = pos(&text, "movq\t-8(%rbp), %rcx");
    assert!(save < call);
    assert!(call < restore);
}

#[test]
fn test_call_result_register_is_not_saved() {
    // rax is live across the call but receives the result; saving and
    // restoring it would destroy the return value.
    let mut oracle = AllocationMap::new();
    oracle.assign("main", IrValue::reg("t"), Reg::Rax);
    oracle.mark_live_registers("main", 0, vec![Reg::Rax]);
    let program = main_with(vec![
        IrInst::Call {
            method: "tick".to_string(),
            args: vec![],
            dest: Some(IrValue::reg("t")),
            external: false,
        },
        IrInst::Return(None),
    ]);
    let text = generate_assembly(&program, &oracle).unwrap();
    assert!(!text.contains("movq\t%rax, -8(%rbp)"));
    assert!(!text.contains("movq\t-8(%rbp), %rax"));
}

#[test]
fn test_array_store_forces_index_once() {
    let arr = IrValue::StackArray { name: "arr".to_string(), len: 4 };
    let addr = IrValue::memory(arr.clone(), IrValue::reg("i"));
    let program = main_with(vec![
        IrInst::GetAddress {
            base: arr,
            index: IrValue::reg("i"),
            dest: addr.clone(),
        },
        IrInst::Copy { src: IrValue::int(5), dest: addr },
        IrInst::Return(None),
    ]);
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();

    // The spilled index is loaded into a register once, at the address
    // computation; the store reuses the rebound register.
    assert_eq!(text.matches("movq\t-8(%rbp), %r11").count(), 1);
    assert!(text.contains("\tmovq\t$5, -48(%rbp,%r11,8)"));
}

#[test]
fn test_copy_between_aliased_locations_is_elided() {
    let mut oracle = AllocationMap::new();
    oracle.assign("main", IrValue::reg("x"), Reg::Rcx);
    oracle.assign("main", IrValue::reg("y"), Reg::Rcx);
    let program = main_with(vec![
        IrInst::Copy { src: IrValue::reg("x"), dest: IrValue::reg("y") },
        IrInst::Return(None),
    ]);
    let text = generate_assembly(&program, &oracle).unwrap();
    assert!(!text.contains("movq\t%rcx, %rcx"));
}

#[test]
fn test_stack_to_stack_copy_stages_through_scratch() {
    let program = main_with(vec![
        IrInst::Copy { src: IrValue::reg("x"), dest: IrValue::reg("x2") },
        IrInst::Copy { src: IrValue::reg("x"), dest: IrValue::reg("x3") },
        IrInst::Return(None),
    ]);
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();
    // x lands at -8, x2 at -16: never a memory-to-memory move.
    assert!(!text.contains("movq\t-8(%rbp), -16(%rbp)"));
    assert!(text.contains("\tmovq\t-8(%rbp), %r10"));
    assert!(text.contains("\tmovq\t%r10, -16(%rbp)"));
}

#[test]
fn test_global_scalar_reads_rip_relative() {
    let program = Program::new(
        vec![
            DataItem::Scalar { name: "counter".to_string(), size: 8 },
            DataItem::Array { name: "table".to_string(), len: 8 },
        ],
        vec![Method::new(
            "main",
            vec![],
            vec![Block::entry(vec![
                IrInst::Copy {
                    src: IrValue::GlobalScalar { name: "counter".to_string() },
                    dest: IrValue::reg("t"),
                },
                IrInst::Return(None),
            ])],
        )],
    );
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();

    assert!(text.contains("\t.comm counter,8,8"));
    assert!(text.contains("\t.comm table,64,16"));
    // Global reads stage through scratch.
    assert!(text.contains("\tmovq\tcounter(%rip), %r10"));
    assert!(text.contains("\tmovq\t%r10, -8(%rbp)"));
}

#[test]
fn test_bounds_check_and_trap_lower_to_nothing() {
    let quiet = main_with(vec![IrInst::Return(None)]);
    let noisy = main_with(vec![
        IrInst::BoundsCheck { index: IrValue::reg("i"), len: 4 },
        IrInst::Trap { message: "index out of bounds".to_string() },
        IrInst::Return(None),
    ]);
    let oracle = AllocationMap::new();
    let a = generate_assembly(&quiet, &oracle).unwrap();
    let b = generate_assembly(&noisy, &AllocationMap::new()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_text_marker_appears_once() {
    let program = Program::new(
        vec![],
        vec![
            Method::new("helper", vec![], vec![Block::entry(vec![IrInst::Return(None)])]),
            Method::new("main", vec![], vec![Block::entry(vec![IrInst::Return(None)])]),
        ],
    );
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();
    assert_eq!(text.matches(".text").count(), 1);
    assert!(text.contains("helper:"));
    assert!(text.contains("_main:"));
    assert!(pos(&text, "helper:") < pos(&text, "_main:"));
    assert!(text.ends_with(".subsections_via_symbols\n"));
}

#[test]
fn test_unconditional_branch_and_labels() {
    let program = main_with(vec![IrInst::Branch { target: "exit_0".to_string() }]);
    let mut with_label = program;
    with_label.methods[0]
        .blocks
        .push(Block::named("exit_0", vec![IrInst::Return(None)]));
    let text = generate_assembly(&with_label, &AllocationMap::new()).unwrap();
    assert!(text.contains("\tjmp\t.exit_0"));
    assert!(text.contains(".exit_0:"));
}

#[test]
fn test_unary_lowerings() {
    let program = main_with(vec![
        IrInst::Unary {
            op: x64gen::ir::UnOp::Neg,
            operand: IrValue::int(7),
            dest: IrValue::reg("t"),
        },
        IrInst::Unary {
            op: x64gen::ir::UnOp::Not,
            operand: IrValue::reg("t"),
            dest: IrValue::reg("u"),
        },
        IrInst::Return(None),
    ]);
    let text = generate_assembly(&program, &AllocationMap::new()).unwrap();
    assert!(text.contains("\tnegq\t%r10"));
    assert!(text.contains("\txorq\t$1, -16(%rbp)"));
}

#[test]
fn test_output_is_deterministic() {
    let build = || {
        let mut oracle = AllocationMap::new();
        oracle.assign("main", IrValue::reg("x"), Reg::Rcx);
        let program = main_with(vec![
            IrInst::Copy { src: IrValue::int(9), dest: IrValue::reg("x") },
            IrInst::Binary {
                op: x64gen::ir::BinOp::Add,
                lhs: IrValue::reg("x"),
                rhs: IrValue::int(1),
                dest: IrValue::reg("y"),
            },
            IrInst::Return(Some(IrValue::reg("y"))),
        ]);
        generate_assembly(&program, &oracle).unwrap()
    };
    assert_eq!(build(), build());
}
