//! Compile-and-link throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use spujit::{
    CilOp, IrInstruction, IrMethod, Linker, LocalVar, MethodCompiler, Program, ValueType,
};

/// A counting-loop method: `local0 = n; while (local0 != 0) local0 -= 1;`
fn loop_method(name: &str, n: i32) -> IrMethod {
    IrMethod {
        name: name.to_string(),
        params: vec![],
        locals: vec![LocalVar {
            ty: ValueType::Int32,
        }],
        init_locals: true,
        body: vec![
            IrInstruction::with_children(
                4,
                CilOp::Stloc(0),
                vec![IrInstruction::new(0, CilOp::LdcI4(n))],
            ),
            IrInstruction::with_children(
                8,
                CilOp::Brfalse(24),
                vec![IrInstruction::new(6, CilOp::Ldloc(0))],
            ),
            IrInstruction::with_children(
                16,
                CilOp::Stloc(0),
                vec![IrInstruction::with_children(
                    14,
                    CilOp::Sub,
                    vec![
                        IrInstruction::new(10, CilOp::Ldloc(0)),
                        IrInstruction::new(12, CilOp::LdcI4(1)),
                    ],
                )],
            ),
            IrInstruction::new(20, CilOp::Br(6)),
            IrInstruction::new(24, CilOp::Ret),
        ],
    }
}

fn program_with_methods(count: usize) -> Program {
    Program {
        methods: (0..count)
            .map(|i| loop_method(&format!("m{}", i), 1000))
            .collect(),
    }
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    for count in [1usize, 16, 64] {
        let program = program_with_methods(count);
        group.bench_with_input(
            BenchmarkId::from_parameter(count),
            &program,
            |b, program| {
                b.iter(|| {
                    let compiler = MethodCompiler::new();
                    let compiled: Vec<_> = program
                        .methods
                        .iter()
                        .map(|m| compiler.compile(m).unwrap())
                        .collect();
                    black_box(Linker::new().link(compiled).unwrap())
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);
