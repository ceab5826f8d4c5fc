mod vm {
    use vireo_bytecode::{BYTECODE_VERSION, Chunk, ChunkBuilder, Op, TypeTag};
    use vireo_vm::prelude::*;

    fn run_program(chunk: Chunk, consts: ConstGlobals, procs: ProcTable, entry: usize) -> Value {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut vm = Vm::new();
        match vm.interpret(chunk, consts, procs, entry) {
            Ok(value) => value,
            Err(error) => panic!("execution failed: {error}"),
        }
    }

    fn run(chunk: Chunk) -> Value {
        run_program(chunk, ConstGlobals::new(), ProcTable::new(), 0)
    }

    fn run_with_procs(chunk: Chunk, procs: ProcTable, entry: usize) -> Value {
        run_program(chunk, ConstGlobals::new(), procs, entry)
    }

    fn run_error(chunk: Chunk) -> Error {
        let _ = env_logger::builder().is_test(true).try_init();
        Vm::new()
            .interpret(chunk, ConstGlobals::new(), ProcTable::new(), 0)
            .expect_err("execution should have failed")
    }

    mod arithmetic {
        use super::*;
        use test_case::test_case;

        #[test_case(Op::Add, Value::int(7) ; "add")]
        #[test_case(Op::Subtract, Value::int(3) ; "subtract")]
        #[test_case(Op::Multiply, Value::int(10) ; "multiply")]
        #[test_case(Op::IntDiv, Value::int(2) ; "int_div")]
        #[test_case(Op::Mod, Value::int(1) ; "modulo")]
        #[test_case(Op::Divide, Value::real(2.5) ; "divide_is_always_real")]
        fn five_op_two(op: Op, expected: Value) {
            let mut builder = ChunkBuilder::new();
            builder.push_int(5).push_int(2).op(op).op(Op::Return);
            assert_eq!(run(builder.finish()), expected);
        }

        #[test]
        fn int_plus_real_promotes() {
            let mut builder = ChunkBuilder::new();
            builder.push_int(1).push_real(2.0).op(Op::Add).op(Op::Return);
            assert_eq!(run(builder.finish()), Value::real(3.0));
        }

        #[test_case(Op::Divide ; "real_division")]
        #[test_case(Op::IntDiv ; "integer_division")]
        #[test_case(Op::Mod ; "modulo")]
        fn division_by_zero_fails(op: Op) {
            let mut builder = ChunkBuilder::new();
            builder.push_int(5).push_int(0).op(op).op(Op::Return);
            assert!(matches!(
                run_error(builder.finish()).kind,
                ErrorKind::DivisionByZero
            ));
        }

        #[test]
        fn integer_overflow_is_detected() {
            let mut builder = ChunkBuilder::new();
            builder
                .push_int(i64::MAX)
                .push_int(1)
                .op(Op::Add)
                .op(Op::Return);
            assert!(matches!(
                run_error(builder.finish()).kind,
                ErrorKind::IntegerOverflow { .. }
            ));
        }

        #[test]
        fn string_and_char_concatenation() {
            let mut builder = ChunkBuilder::new();
            builder
                .push_str("ha")
                .push_char(b't')
                .op(Op::Add)
                .op(Op::Return);
            assert_eq!(run(builder.finish()), Value::string("hat"));
        }

        #[test_case(Op::And, 2 ; "bitwise_and")]
        #[test_case(Op::Or, 7 ; "bitwise_or")]
        #[test_case(Op::Xor, 5 ; "bitwise_xor")]
        fn six_bitop_three(op: Op, expected: i64) {
            let mut builder = ChunkBuilder::new();
            builder.push_int(6).push_int(3).op(op).op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(expected));
        }

        #[test]
        fn shifts() {
            let mut builder = ChunkBuilder::new();
            builder
                .push_int(1)
                .push_int(4)
                .op(Op::Shl)
                .push_int(2)
                .op(Op::Shr)
                .op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(4));
        }

        #[test]
        fn negate_and_not() {
            let mut builder = ChunkBuilder::new();
            builder
                .push_int(5)
                .op(Op::Negate)
                .op(Op::ToBool)
                .op(Op::Not)
                .op(Op::Return);
            assert_eq!(run(builder.finish()), Value::Bool(false));
        }
    }

    mod comparisons {
        use super::*;
        use test_case::test_case;

        #[test_case(Op::Less, true ; "less")]
        #[test_case(Op::LessEqual, true ; "less_equal")]
        #[test_case(Op::Greater, false ; "greater")]
        #[test_case(Op::Equal, false ; "equal")]
        #[test_case(Op::NotEqual, true ; "not_equal")]
        fn one_compared_to_two(op: Op, expected: bool) {
            let mut builder = ChunkBuilder::new();
            builder.push_int(1).push_int(2).op(op).op(Op::Return);
            assert_eq!(run(builder.finish()), Value::Bool(expected));
        }

        #[test]
        fn int_and_real_compare_numerically() {
            let mut builder = ChunkBuilder::new();
            builder.push_int(2).push_real(2.0).op(Op::Equal).op(Op::Return);
            assert_eq!(run(builder.finish()), Value::Bool(true));
        }

        #[test]
        fn char_equals_single_char_string() {
            let mut builder = ChunkBuilder::new();
            builder
                .push_char(b'x')
                .push_str("x")
                .op(Op::Equal)
                .op(Op::Return);
            assert_eq!(run(builder.finish()), Value::Bool(true));
        }

        #[test]
        fn string_ordering_is_bytewise() {
            let mut builder = ChunkBuilder::new();
            builder
                .push_str("abc")
                .push_str("abd")
                .op(Op::Less)
                .op(Op::Return);
            assert_eq!(run(builder.finish()), Value::Bool(true));
        }

        #[test]
        fn mismatched_operands_fail() {
            let mut builder = ChunkBuilder::new();
            builder.push_str("a").push_int(1).op(Op::Less).op(Op::Return);
            assert!(matches!(
                run_error(builder.finish()).kind,
                ErrorKind::InvalidBinaryOp { .. }
            ));
        }
    }

    mod stack_ops {
        use super::*;

        #[test]
        fn swap_exchanges_the_top_pair() {
            let mut builder = ChunkBuilder::new();
            builder.push_int(1).push_int(2).op(Op::Swap).op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(1));
        }

        #[test]
        fn dup_then_add_doubles() {
            let mut builder = ChunkBuilder::new();
            builder.push_int(21).op(Op::Dup).op(Op::Add).op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(42));
        }

        #[test]
        fn pop_discards() {
            let mut builder = ChunkBuilder::new();
            builder.push_int(1).push_int(2).op(Op::Pop).op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(1));
        }

        #[test]
        fn underflow_is_reported() {
            let mut builder = ChunkBuilder::new();
            builder.op(Op::Pop).op(Op::Return);
            assert!(matches!(
                run_error(builder.finish()).kind,
                ErrorKind::StackUnderflow
            ));
        }
    }

    mod jumps {
        use super::*;

        #[test]
        fn conditional_branch_takes_the_then_arm() {
            let mut builder = ChunkBuilder::new();
            builder.op(Op::ConstTrue);
            let else_jump = builder.jump(Op::JumpIfFalse);
            builder.push_int(1);
            let end_jump = builder.jump(Op::Jump);
            builder.patch_jump(else_jump);
            builder.push_int(2);
            builder.patch_jump(end_jump);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(1));
        }

        #[test]
        fn conditional_branch_takes_the_else_arm() {
            let mut builder = ChunkBuilder::new();
            builder.op(Op::ConstFalse);
            let else_jump = builder.jump(Op::JumpIfFalse);
            builder.push_int(1);
            let end_jump = builder.jump(Op::Jump);
            builder.patch_jump(else_jump);
            builder.push_int(2);
            builder.patch_jump(end_jump);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(2));
        }

        #[test]
        fn while_loop_counts_to_three() {
            // while i < 3 do i := i + 1
            let mut builder = ChunkBuilder::new();
            builder.define_global("i", TypeTag::Int32);
            let start = builder.position();
            builder.get_global("i").push_int(3).op(Op::Less);
            let exit = builder.jump(Op::JumpIfFalse);
            builder
                .get_global("i")
                .push_int(1)
                .op(Op::Add)
                .set_global("i");
            builder.loop_back(start);
            builder.patch_jump(exit);
            builder.get_global("i").op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(3));
        }
    }

    mod globals {
        use super::*;

        #[test]
        fn define_set_get() {
            let mut builder = ChunkBuilder::new();
            builder.define_global("x", TypeTag::Int32);
            builder.push_int(41).set_global("x");
            builder.get_global("x").push_int(1).op(Op::Add).op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(42));
        }

        #[test]
        fn lookup_is_case_insensitive() {
            let mut builder = ChunkBuilder::new();
            builder.define_global("Counter", TypeTag::Int32);
            builder.push_int(7).set_global("COUNTER");
            builder.get_global("counter").op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(7));
        }

        #[test]
        fn undefined_global_fails() {
            let mut builder = ChunkBuilder::new();
            builder.get_global("nowhere").op(Op::Return);
            assert!(matches!(
                run_error(builder.finish()).kind,
                ErrorKind::UndefinedGlobal(_)
            ));
        }

        #[test]
        fn constants_reject_assignment() {
            let mut consts = ConstGlobals::new();
            consts.insert("limit", TypeTag::Int32, Value::int(100));
            let mut builder = ChunkBuilder::new();
            builder.push_int(5).set_global("limit").op(Op::Return);
            let error = Vm::new()
                .interpret(builder.finish(), consts, ProcTable::new(), 0)
                .unwrap_err();
            assert!(matches!(error.kind, ErrorKind::AssignToConst(_)));
        }

        #[test]
        fn constants_are_readable() {
            let mut consts = ConstGlobals::new();
            consts.insert("limit", TypeTag::Int32, Value::int(100));
            let mut builder = ChunkBuilder::new();
            builder.get_global("limit").op(Op::Return);
            assert_eq!(
                run_program(builder.finish(), consts, ProcTable::new(), 0),
                Value::int(100)
            );
        }

        #[test]
        fn narrow_global_wraps_out_of_range_stores() {
            let mut builder = ChunkBuilder::new();
            builder.define_global("b", TypeTag::Byte);
            builder.push_int(300).set_global("b");
            builder.get_global("b").op(Op::Return);
            // 300 wrapped into the byte range
            assert_eq!(run(builder.finish()), Value::int(44));
        }

        #[test]
        fn address_store_round_trips() {
            let mut builder = ChunkBuilder::new();
            builder.define_global("x", TypeTag::Int32);
            builder.get_global_address("x");
            builder.push_int(9).op(Op::SetIndirect);
            builder.get_global_address("x").op(Op::GetIndirect);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(9));
        }
    }

    mod locals {
        use super::*;

        fn routine(build_body: impl FnOnce(&mut ChunkBuilder), locals: u16) -> Value {
            let mut builder = ChunkBuilder::new();
            let proc_entry = builder.position();
            build_body(&mut builder);
            let main = builder.position();
            builder.call("body", proc_entry as u16, 0);
            builder.op(Op::Return);

            let mut procs = ProcTable::new();
            procs.insert(ProcInfo::new("body", proc_entry as u32, 0, locals));
            run_with_procs(builder.finish(), procs, main)
        }

        #[test]
        fn set_and_get() {
            let result = routine(
                |builder| {
                    builder.push_int(5).op(Op::SetLocal).byte(0);
                    builder.op(Op::GetLocal).byte(0);
                    builder.op(Op::Return);
                },
                1,
            );
            assert_eq!(result, Value::int(5));
        }

        #[test]
        fn inc_and_dec() {
            let result = routine(
                |builder| {
                    builder.push_int(5).op(Op::SetLocal).byte(0);
                    builder.op(Op::IncLocal).byte(0);
                    builder.op(Op::IncLocal).byte(0);
                    builder.op(Op::DecLocal).byte(0);
                    builder.op(Op::GetLocal).byte(0);
                    builder.op(Op::Return);
                },
                1,
            );
            assert_eq!(result, Value::int(6));
        }

        #[test]
        fn initialized_pointer_local_is_nil() {
            let result = routine(
                |builder| {
                    builder.op(Op::InitLocalPointer).byte(0);
                    builder.op(Op::GetLocal).byte(0);
                    builder.op(Op::Return);
                },
                1,
            );
            assert_eq!(result, Value::Pointer(Pointer::Nil));
        }

        #[test]
        fn initialized_array_local_holds_elements() {
            let result = routine(
                |builder| {
                    // var a: array[1..2] of integer
                    let lower = builder.int_constant(1);
                    let upper = builder.int_constant(2);
                    builder
                        .op(Op::InitLocalArray)
                        .byte(0)
                        .byte(1)
                        .u16(lower)
                        .u16(upper)
                        .byte(TypeTag::Int32 as u8);
                    builder.op(Op::GetLocalAddress).byte(0);
                    builder.push_int(2);
                    builder.op(Op::GetElementAddress).byte(1);
                    builder.op(Op::Dup);
                    builder.push_int(8).op(Op::SetIndirect);
                    builder.op(Op::GetIndirect);
                    builder.op(Op::Return);
                },
                1,
            );
            assert_eq!(result, Value::int(8));
        }
    }

    mod strings {
        use super::*;

        #[test]
        fn one_based_read() {
            let mut builder = ChunkBuilder::new();
            builder.define_string_global("s", 0);
            builder.push_str("hat").set_global("s");
            builder.get_global("s").push_int(1).op(Op::GetCharFromString);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::Char(b'h'));
        }

        #[test]
        fn index_zero_reads_the_length() {
            let mut builder = ChunkBuilder::new();
            builder.define_string_global("s", 0);
            builder.push_str("hat").set_global("s");
            builder.get_global("s").push_int(0).op(Op::GetCharFromString);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(3));
        }

        #[test]
        fn out_of_range_read_fails() {
            let mut builder = ChunkBuilder::new();
            builder.define_string_global("s", 0);
            builder.push_str("hat").set_global("s");
            builder.get_global("s").push_int(4).op(Op::GetCharFromString);
            builder.op(Op::Return);
            assert!(matches!(
                run_error(builder.finish()).kind,
                ErrorKind::IndexOutOfRange { index: 4, .. }
            ));
        }

        #[test]
        fn char_store_through_element_address() {
            let mut builder = ChunkBuilder::new();
            builder.define_string_global("s", 0);
            builder.push_str("hat").set_global("s");
            builder.get_global_address("s");
            builder.push_int(1);
            builder.op(Op::GetElementAddress).byte(1);
            builder.push_char(b'c').op(Op::SetIndirect);
            builder.get_global("s").op(Op::Return);
            assert_eq!(run(builder.finish()), Value::string("cat"));
        }

        #[test]
        fn length_store_truncates() {
            let mut builder = ChunkBuilder::new();
            builder.define_string_global("s", 0);
            builder.push_str("hat").set_global("s");
            builder.get_global_address("s");
            builder.push_int(0);
            builder.op(Op::GetElementAddress).byte(1);
            builder.push_int(2).op(Op::SetIndirect);
            builder.get_global("s").op(Op::Return);
            assert_eq!(run(builder.finish()), Value::string("ha"));
        }

        #[test]
        fn fixed_string_assignment_truncates() {
            let mut builder = ChunkBuilder::new();
            builder.define_string_global("s", 3);
            builder.push_str("hello").set_global("s");
            builder.get_global("s").op(Op::Return);
            assert_eq!(run(builder.finish()), Value::string("hel"));
        }
    }

    mod arrays {
        use super::*;

        #[test]
        fn element_store_and_load() {
            let mut builder = ChunkBuilder::new();
            builder.define_array_global("a", &[(1, 3)], TypeTag::Int32);
            builder.get_global_address("a");
            builder.push_int(2);
            builder.op(Op::GetElementAddress).byte(1);
            builder.op(Op::Dup);
            builder.push_int(7).op(Op::SetIndirect);
            builder.op(Op::GetIndirect);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(7));
        }

        #[test]
        fn bounds_are_checked() {
            let mut builder = ChunkBuilder::new();
            builder.define_array_global("a", &[(1, 3)], TypeTag::Int32);
            builder.get_global_address("a");
            builder.push_int(4);
            builder.op(Op::GetElementAddress).byte(1);
            builder.op(Op::Return);
            assert!(matches!(
                run_error(builder.finish()).kind,
                ErrorKind::IndexOutOfRange {
                    index: 4,
                    min: 1,
                    max: 3
                }
            ));
        }

        #[test]
        fn two_dimensional_indexing_is_row_major() {
            let mut builder = ChunkBuilder::new();
            builder.define_array_global("m", &[(1, 2), (1, 2)], TypeTag::Int32);
            // m[2, 1] := 5
            builder.get_global_address("m");
            builder.push_int(2).push_int(1);
            builder.op(Op::GetElementAddress).byte(2);
            builder.push_int(5).op(Op::SetIndirect);
            // read it back
            builder.get_global_address("m");
            builder.push_int(2).push_int(1);
            builder.op(Op::GetElementAddress).byte(2);
            builder.op(Op::GetIndirect);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(5));
        }

        #[test]
        fn packed_byte_arrays_truncate_stores() {
            let mut builder = ChunkBuilder::new();
            builder.define_array_global("b", &[(0, 3)], TypeTag::Byte);
            builder.get_global_address("b");
            builder.push_int(0);
            builder.op(Op::GetElementAddress).byte(1);
            builder.op(Op::Dup);
            builder.push_int(300).op(Op::SetIndirect);
            builder.op(Op::GetIndirect);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(44));
        }

        #[test]
        fn constant_index_addressing() {
            let mut builder = ChunkBuilder::new();
            builder.define_array_global("a", &[(1, 3)], TypeTag::Int32);
            builder.get_global_address("a");
            // a[2] is flat offset 1
            builder.op(Op::GetElementAddressConst).u16(1);
            builder.push_int(6).op(Op::SetIndirect);
            builder.get_global_address("a");
            builder.push_int(2);
            builder.op(Op::LoadElementValue).byte(1);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(6));
        }
    }

    mod sets {
        use super::*;
        use test_case::test_case;

        fn const_set(name: &str, ordinals: &[i64]) -> (String, Value) {
            (
                name.to_string(),
                Value::Set(SetValue::from_ordinals(ordinals.to_vec())),
            )
        }

        #[test_case(2, true ; "member")]
        #[test_case(5, false ; "non_member")]
        fn membership(needle: i64, expected: bool) {
            let mut consts = ConstGlobals::new();
            let (name, set) = const_set("evens", &[2, 4, 6]);
            consts.insert(&name, TypeTag::Set, set);

            let mut builder = ChunkBuilder::new();
            builder.push_int(needle);
            builder.get_global("evens");
            builder.op(Op::In).op(Op::Return);
            assert_eq!(
                run_program(builder.finish(), consts, ProcTable::new(), 0),
                Value::Bool(expected)
            );
        }

        #[test_case(Op::Add, &[1, 2, 3] ; "union")]
        #[test_case(Op::Multiply, &[2] ; "intersection")]
        #[test_case(Op::Subtract, &[1] ; "difference")]
        fn set_algebra(op: Op, expected: &[i64]) {
            let mut consts = ConstGlobals::new();
            for (name, set) in [
                const_set("a", &[1, 2]),
                const_set("b", &[2, 3]),
                const_set("expected", expected),
            ] {
                consts.insert(&name, TypeTag::Set, set);
            }

            let mut builder = ChunkBuilder::new();
            builder.get_global("a").get_global("b").op(op);
            builder.get_global("expected").op(Op::Equal);
            builder.op(Op::Return);
            assert_eq!(
                run_program(builder.finish(), consts, ProcTable::new(), 0),
                Value::Bool(true)
            );
        }

        #[test]
        fn subset_comparison() {
            let mut consts = ConstGlobals::new();
            for (name, set) in [const_set("a", &[1, 2]), const_set("b", &[1, 2, 3])] {
                consts.insert(&name, TypeTag::Set, set);
            }

            let mut builder = ChunkBuilder::new();
            builder.get_global("a").get_global("b").op(Op::LessEqual);
            builder.op(Op::Return);
            assert_eq!(
                run_program(builder.finish(), consts, ProcTable::new(), 0),
                Value::Bool(true)
            );
        }
    }

    mod calls {
        use super::*;

        #[test]
        fn function_call_and_return() {
            let mut builder = ChunkBuilder::new();
            // function addone(n): n + 1
            let add_one = builder.position();
            builder.op(Op::GetLocal).byte(0);
            builder.push_int(1).op(Op::Add);
            builder.op(Op::Return);

            let main = builder.position();
            builder.push_int(41);
            builder.call("addone", add_one as u16, 1);
            builder.op(Op::Return);

            let mut procs = ProcTable::new();
            procs.insert(ProcInfo::new("addone", add_one as u32, 1, 0));
            assert_eq!(
                run_with_procs(builder.finish(), procs, main),
                Value::int(42)
            );
        }

        #[test]
        fn arity_is_checked() {
            let mut builder = ChunkBuilder::new();
            let noop = builder.position();
            builder.op(Op::Return);
            let main = builder.position();
            builder.push_int(1);
            builder.call("noop", noop as u16, 1);
            builder.op(Op::Return);

            let mut procs = ProcTable::new();
            procs.insert(ProcInfo::new("noop", noop as u32, 0, 0));
            let error = Vm::new()
                .interpret(builder.finish(), ConstGlobals::new(), procs, main)
                .unwrap_err();
            assert!(matches!(
                error.kind,
                ErrorKind::ArityMismatch {
                    expected: 0,
                    found: 1,
                    ..
                }
            ));
        }

        #[test]
        fn forward_declared_routines_cannot_be_called() {
            let mut builder = ChunkBuilder::new();
            let main = builder.position();
            builder.call("missing", 500, 0);
            builder.op(Op::Return);

            let mut procs = ProcTable::new();
            procs.insert(ProcInfo {
                name: "missing".into(),
                entry: 500,
                arity: 0,
                locals_count: 0,
                upvalues: Vec::new(),
                enclosing: None,
                defined: false,
            });
            let error = Vm::new()
                .interpret(builder.finish(), ConstGlobals::new(), procs, main)
                .unwrap_err();
            assert!(matches!(error.kind, ErrorKind::UnknownProcedure(_)));
        }

        #[test]
        fn statement_calls_leave_the_stack_balanced() {
            let mut builder = ChunkBuilder::new();
            let five = builder.position();
            builder.push_int(5).op(Op::Return);

            let main = builder.position();
            builder.push_int(five as i64);
            builder.op(Op::ProcCallIndirect).byte(0);
            builder.push_int(1);
            builder.op(Op::Return);

            let mut procs = ProcTable::new();
            procs.insert(ProcInfo::new("five", five as u32, 0, 0));
            assert_eq!(run_with_procs(builder.finish(), procs, main), Value::int(1));
        }

        #[test]
        fn indirect_calls_through_an_entry_address() {
            let mut builder = ChunkBuilder::new();
            let five = builder.position();
            builder.push_int(5).op(Op::Return);

            let main = builder.position();
            builder.push_int(five as i64);
            builder.op(Op::CallIndirect).byte(0);
            builder.op(Op::Return);

            let mut procs = ProcTable::new();
            procs.insert(ProcInfo::new("five", five as u32, 0, 0));
            assert_eq!(run_with_procs(builder.finish(), procs, main), Value::int(5));
        }

        #[test]
        fn halt_unwinds_nested_calls() {
            let mut builder = ChunkBuilder::new();
            let stopper = builder.position();
            builder.push_int(7).op(Op::Halt);

            let main = builder.position();
            builder.call("stopper", stopper as u16, 0);
            builder.push_int(1);
            builder.op(Op::Return);

            let mut procs = ProcTable::new();
            procs.insert(ProcInfo::new("stopper", stopper as u32, 0, 0));
            assert_eq!(run_with_procs(builder.finish(), procs, main), Value::int(7));
        }
    }

    mod closures {
        use super::*;

        fn capture_program(is_ref: bool) -> Value {
            let mut builder = ChunkBuilder::new();
            // inner: returns the captured variable
            let inner = builder.position();
            builder.op(Op::GetUpvalue).byte(0);
            builder.op(Op::Return);

            // outer: x := 10; c := closure(inner); x := 20; c()
            let outer = builder.position();
            builder.push_int(10).op(Op::SetLocal).byte(0);
            builder.push_int(inner as i64);
            builder.op(Op::CallHost).byte(HostId::MakeClosure as u8).byte(1);
            builder.push_int(20).op(Op::SetLocal).byte(0);
            builder.op(Op::CallIndirect).byte(0);
            builder.op(Op::Return);

            let main = builder.position();
            builder.call("outer", outer as u16, 0);
            builder.op(Op::Return);

            let mut procs = ProcTable::new();
            let outer_proc = procs.insert(ProcInfo::new("outer", outer as u32, 0, 1));
            procs.insert(ProcInfo {
                name: "inner".into(),
                entry: inner as u32,
                arity: 0,
                locals_count: 0,
                upvalues: vec![UpvalueDesc {
                    index: 0,
                    is_local: true,
                    is_ref,
                }],
                enclosing: Some(outer_proc),
                defined: true,
            });
            run_with_procs(builder.finish(), procs, main)
        }

        #[test]
        fn by_reference_captures_see_later_writes() {
            assert_eq!(capture_program(true), Value::int(20));
        }

        #[test]
        fn by_value_captures_are_snapshots() {
            assert_eq!(capture_program(false), Value::int(10));
        }
    }

    mod objects {
        use super::*;

        // Allocates an object whose hidden first field carries the class
        // name, stores 9 into field 1, and leaves its pointer on the stack.
        fn emit_point(builder: &mut ChunkBuilder) {
            builder.op(Op::AllocObject).byte(2);
            builder.op(Op::Dup);
            builder.op(Op::GetFieldOffset).byte(0);
            builder.push_str("point").op(Op::SetIndirect);
            builder.op(Op::Dup);
            builder.op(Op::GetFieldOffset).byte(1);
            builder.push_int(9).op(Op::SetIndirect);
        }

        fn point_procs(builder: &mut ChunkBuilder) -> (ProcTable, usize) {
            // method slot 0: returns field 1 of the receiver
            let getter = builder.position();
            builder.op(Op::GetLocal).byte(0);
            builder.op(Op::LoadFieldValue).byte(1);
            builder.op(Op::Return);

            let mut procs = ProcTable::new();
            let getter_proc = procs.insert(ProcInfo::new("point_value", getter as u32, 1, 0));
            procs.alias("point.0", &getter_proc);
            (procs, getter)
        }

        #[test]
        fn field_store_and_load_by_offset() {
            let mut builder = ChunkBuilder::new();
            emit_point(&mut builder);
            builder.op(Op::LoadFieldValue).byte(1);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(9));
        }

        #[test]
        fn field_load_by_name() {
            let mut builder = ChunkBuilder::new();
            builder.op(Op::AllocObject).byte(1);
            builder.op(Op::Dup);
            let field = builder.str_constant("");
            builder.op(Op::GetFieldAddress).byte(field as u8);
            builder.push_int(3).op(Op::SetIndirect);
            builder.op(Op::LoadFieldValueByName).byte(field as u8);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::int(3));
        }

        #[test]
        fn method_call_through_the_hidden_class_field() {
            let mut builder = ChunkBuilder::new();
            let (procs, _) = point_procs(&mut builder);
            let main = builder.position();
            emit_point(&mut builder);
            builder.op(Op::CallMethod).byte(0).byte(0);
            builder.op(Op::Return);
            assert_eq!(run_with_procs(builder.finish(), procs, main), Value::int(9));
        }

        #[test]
        fn method_call_through_a_boxed_interface() {
            let mut builder = ChunkBuilder::new();
            let (procs, _) = point_procs(&mut builder);
            let main = builder.position();
            emit_point(&mut builder);
            builder.push_str("point");
            builder
                .op(Op::CallHost)
                .byte(HostId::InterfaceBox as u8)
                .byte(2);
            builder.op(Op::CallMethod).byte(0).byte(0);
            builder.op(Op::Return);
            assert_eq!(run_with_procs(builder.finish(), procs, main), Value::int(9));
        }

        #[test]
        fn interface_assertion_rejects_the_wrong_class() {
            let mut builder = ChunkBuilder::new();
            let (procs, _) = point_procs(&mut builder);
            let main = builder.position();
            emit_point(&mut builder);
            builder.push_str("point");
            builder
                .op(Op::CallHost)
                .byte(HostId::InterfaceBox as u8)
                .byte(2);
            builder.push_str("circle");
            builder
                .op(Op::CallHost)
                .byte(HostId::InterfaceAssert as u8)
                .byte(2);
            builder.op(Op::Return);
            let error = Vm::new()
                .interpret(builder.finish(), ConstGlobals::new(), procs, main)
                .unwrap_err();
            assert!(matches!(error.kind, ErrorKind::StringError(_)));
        }

        #[test]
        fn method_calls_on_non_objects_fail() {
            let mut builder = ChunkBuilder::new();
            builder.push_int(1);
            builder.op(Op::CallMethod).byte(0).byte(0);
            builder.op(Op::Return);
            assert!(matches!(
                run_error(builder.finish()).kind,
                ErrorKind::UnexpectedType { .. }
            ));
        }
    }

    mod builtins {
        use super::*;

        fn answer(_vm: &mut Vm, _args: &mut [Value]) -> Result<Value> {
            Ok(Value::int(42))
        }

        fn touch(_vm: &mut Vm, _args: &mut [Value]) -> Result<Value> {
            Ok(Value::int(1))
        }

        #[test]
        fn only_function_builtins_push_a_result() {
            let mut builder = ChunkBuilder::new();
            builder.call_builtin("answer", 0);
            builder.call_builtin("touch", 0);
            builder.op(Op::Return);

            let mut vm = Vm::new();
            {
                let mut builtins = vm.context().builtins.write();
                builtins.register("answer", answer, true);
                builtins.register("touch", touch, false);
            }
            let result = vm
                .interpret(builder.finish(), ConstGlobals::new(), ProcTable::new(), 0)
                .unwrap();
            assert_eq!(result, Value::int(42));
        }

        #[test]
        fn id_carrying_calls_fall_back_to_the_name() {
            let mut builder = ChunkBuilder::new();
            let name = builder.str_constant("answer");
            // A stale id with a mismatched name still resolves by name
            builder.op(Op::CallBuiltinProc).u16(999).u16(name).byte(0);
            builder.push_int(3);
            builder.op(Op::Return);

            let mut vm = Vm::new();
            vm.context().builtins.write().register("answer", answer, true);
            let result = vm
                .interpret(builder.finish(), ConstGlobals::new(), ProcTable::new(), 0)
                .unwrap();
            assert_eq!(result, Value::int(3));
        }

        #[test]
        fn unknown_builtins_are_reported() {
            let mut builder = ChunkBuilder::new();
            builder.call_builtin("nothing", 0);
            builder.op(Op::Return);
            assert!(matches!(
                run_error(builder.finish()).kind,
                ErrorKind::UnknownBuiltin(_)
            ));
        }

        #[test]
        fn shell_condition_maps_exit_status_to_bool() {
            let mut builder = ChunkBuilder::new();
            builder.push_int(0);
            builder
                .op(Op::CallHost)
                .byte(HostId::ShellConditionHelper as u8)
                .byte(1);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::Bool(true));
        }
    }

    mod formatting {
        use super::*;

        #[test]
        fn width_and_precision() {
            let mut builder = ChunkBuilder::new();
            builder.push_real(3.14159);
            builder.op(Op::FormatValue).byte(8).byte(2);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::string("    3.14"));
        }

        #[test]
        fn unspecified_operands_use_the_default_rendering() {
            let mut builder = ChunkBuilder::new();
            builder.push_int(42);
            builder.op(Op::FormatValue).byte(u8::MAX).byte(u8::MAX);
            builder.op(Op::Return);
            assert_eq!(run(builder.finish()), Value::string("42"));
        }
    }

    mod failures {
        use super::*;

        #[test]
        fn version_mismatch_is_rejected() {
            let chunk = Chunk::new(
                BYTECODE_VERSION + 1,
                vec![Op::Return as u8],
                Vec::new(),
                vec![0],
            );
            let error = Vm::new()
                .interpret(chunk, ConstGlobals::new(), ProcTable::new(), 0)
                .unwrap_err();
            assert!(matches!(error.kind, ErrorKind::VersionMismatch { .. }));
        }

        #[test]
        fn errors_carry_the_source_line() {
            let mut builder = ChunkBuilder::new();
            builder.set_line(5);
            builder.push_int(1).push_int(0).op(Op::IntDiv).op(Op::Return);
            let error = run_error(builder.finish());
            assert!(matches!(error.kind, ErrorKind::DivisionByZero));
            assert_eq!(error.trace.first().map(|frame| frame.line), Some(5));
        }

        #[test]
        fn errors_in_callees_trace_through_the_caller() {
            let mut builder = ChunkBuilder::new();
            builder.set_line(2);
            let failing = builder.position();
            builder.push_int(1).push_int(0).op(Op::IntDiv).op(Op::Return);

            builder.set_line(9);
            let main = builder.position();
            builder.call("failing", failing as u16, 0);
            builder.op(Op::Return);

            let mut procs = ProcTable::new();
            procs.insert(ProcInfo::new("failing", failing as u32, 0, 0));
            let error = Vm::new()
                .interpret(builder.finish(), ConstGlobals::new(), procs, main)
                .unwrap_err();
            let lines: Vec<u32> = error.trace.iter().map(|frame| frame.line).collect();
            assert_eq!(lines, vec![2, 9]);
        }

        #[test]
        fn truncated_instructions_are_detected() {
            let mut builder = ChunkBuilder::new();
            builder.op(Op::PushInt8);
            let error = run_error(builder.finish());
            assert!(matches!(error.kind, ErrorKind::TruncatedInstruction));
        }

        #[test]
        fn nil_pointer_reads_fail() {
            let mut builder = ChunkBuilder::new();
            builder.define_global("p", TypeTag::Pointer);
            builder.get_global("p").op(Op::GetIndirect);
            builder.op(Op::Return);
            assert!(matches!(
                run_error(builder.finish()).kind,
                ErrorKind::NilDereference
            ));
        }
    }
}
