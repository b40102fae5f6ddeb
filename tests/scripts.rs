use pretty_assertions::assert_eq;
use ulox::{
    compile_source,
    debug::{disassemble_chunk, jump_targets},
    error::UloxError,
    scanner::{Literal, Scanner, TokenType},
    Context, ContextConfig, RuntimeErrorKind, Script, Value, VmConfig,
};

fn context() -> Context {
    Context::new(ContextConfig {
        vm: VmConfig {
            echo_print: false,
            ..VmConfig::default()
        },
        bind_core: true,
    })
}

fn run(text: &str) -> Context {
    let mut context = context();
    if let Err(err) = context.run_source(Script::new("main", text)) {
        panic!("script failed: {}", err);
    }
    context
}

fn run_err(text: &str) -> UloxError {
    context().run_source(Script::new("main", text)).unwrap_err()
}

#[test]
fn rescanning_after_reset_is_identical() {
    let text = "class A { var x = 1.5; Meth() { retval = this.x * 2; } } /* note */ // trailing";
    let mut scanner = Scanner::new();
    let first = scanner.scan(text).unwrap();
    scanner.reset();
    let second = scanner.scan(text).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.last().map(|t| t.token_type), Some(TokenType::Eof));
}

#[test]
fn number_literals_keep_decimal_flavor() {
    let tokens = Scanner::new().scan("3 3.0 12.25").unwrap();
    let flavors: Vec<_> = tokens.iter().take(3).map(|t| t.token_type).collect();
    assert_eq!(flavors, vec![TokenType::Int, TokenType::Float, TokenType::Float]);
    assert_eq!(tokens[0].literal, tokens[1].literal);
    assert_eq!(tokens[2].literal, Literal::Number(12.25));
}

#[test]
fn every_jump_lands_inside_the_chunk() {
    let chunk = compile_source(
        "jumps",
        r#"
        class P { var a = 1; var b = 2; Meth() { if (this.a) { retval = 1; } else { retval = 2; } } }
        var i = 0;
        while (i < 3) { i += 1; if (i == 2) { continue; } }
        for (var j = 0; j < 2; j += 1) { loop { break; } }
        var x = true and false or true;
        test T { testcase A { } testcase B { } }
        "#,
    )
    .unwrap();
    let targets = jump_targets(&chunk);
    assert!(!targets.is_empty());
    assert!(targets.iter().all(|target| *target <= chunk.len()), "{}", disassemble_chunk(&chunk));
}

#[test]
fn fields_initialize_in_declaration_order_and_inherit() {
    let context = run(
        r#"
        class Base { var a = 1, b = 2, c = 3; }
        class Derived < Base { }
        var base = Base();
        var derived = Derived();
        print(base.a); print(base.b); print(base.c);
        print(derived.a + derived.b + derived.c);
        "#,
    );
    assert_eq!(context.vm().printed(), "1\n2\n3\n6\n");

    let base = context.vm().get_global("base");
    let names: Vec<String> = match base {
        Some(Value::Instance(instance)) => instance
            .borrow()
            .fields
            .iter()
            .map(|(name, _)| name.as_str().to_string())
            .collect(),
        _ => vec![],
    };
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn construction_runs_inherited_own_mixin_fields_then_init() {
    let context = run(
        r#"
        var log = "";
        fun note(s) { log = log + s; return s; }
        class A { var a = note("A"); }
        class M { var m = note("M"); }
        class B < A {
            mixin M;
            var b = note("B");
            init() { note("I"); }
        }
        var b = B();
        print(log);
        print(b.a + b.b + b.m);
        "#,
    );
    assert_eq!(context.vm().printed(), "ABMI\nABM\n");
}

#[test]
fn mixin_fields_and_methods() {
    let context = run(
        r#"
        class Foo { var b = 2, c, d = "Hello"; }
        class Bar { var e = 3, f, g = "World"; Meth() { retval = this.e; } }
        class FooBar { mixin Foo, Bar; }
        var fb = FooBar();
        assert(fb.b == 2);
        assert(fb.c == null);
        assert(fb.d == "Hello");
        assert(fb.e == 3);
        assert(fb.f == null);
        assert(fb.g == "World");
        assert(fb.Meth() == fb.e);
        print(fb.d + " " + fb.g);
        "#,
    );
    assert_eq!(context.vm().printed(), "Hello World\n");
}

#[test]
fn test_ledger_records_incomplete_cases() {
    let context = run(r#"test "T" { testcase "ok" { } testcase "bad" { throw "x"; } }"#);
    let runner = context.test_runner();
    let runner = runner.borrow();
    assert_eq!(runner.tests_found(), 2);
    assert!(!runner.all_passed());
    let dump = runner.generate_dump();
    assert!(dump.contains("\"T:ok\" Completed"), "{}", dump);
    assert!(dump.contains("\"T:bad\" Incomplete"), "{}", dump);
}

#[test]
fn failing_case_does_not_stop_later_sets() {
    let context = run(
        r#"
        test First { testcase Fails { assert(false); } }
        test Second { testcase Passes { assert_eq(1 + 1, 2); } }
        print("done");
        "#,
    );
    let dump = context.test_runner().borrow().generate_dump();
    assert_eq!(dump, "\"First:Fails\" Incomplete\n\"Second:Passes\" Completed\n");
    assert_eq!(context.vm().printed(), "done\n");
}

#[test]
fn frozen_instance_allows_existing_fields_only() {
    let context = run(
        r#"
        class P { var x = 1; }
        var p = P();
        freeze p;
        p.x = 2;
        print(p.x);
        "#,
    );
    assert_eq!(context.vm().printed(), "2\n");

    match run_err("class P { var x = 1; } var p = P(); freeze p; p.y = 2;") {
        UloxError::Runtime(err) => assert_eq!(err.kind, RuntimeErrorKind::FreezeViolation),
        other => panic!("unexpected error {}", other),
    }
}

#[test]
fn closure_writes_through_to_enclosing_local() {
    let context = run("fun Foo(){ var a=10; fun Bar(){ a=7; } Bar(); print(a); } Foo();");
    assert_eq!(context.vm().printed(), "7\n");
}

#[test]
fn local_declaration_errors() {
    assert!(matches!(run_err("fun f() { var a = a; }"), UloxError::Compile(_)));
    assert!(matches!(run_err("fun f() { var a = 1; var a = 2; }"), UloxError::Compile(_)));
    assert!(matches!(run_err("var s = \"open"), UloxError::Scan(_)));
}

#[test]
fn runtime_error_carries_location_and_stacks() {
    match run_err("fun Inner() { retval = 1 + nil; }\nfun Outer() { Inner(); }\nOuter();") {
        UloxError::Runtime(err) => {
            assert_eq!(err.kind, RuntimeErrorKind::TypeMismatch);
            assert_eq!(err.chunk, "Inner");
            assert!(err.call_stack.contains("Outer"), "{}", err.call_stack);
            assert!(err.message.contains("Double") && err.message.contains("Null"), "{}", err.message);
        }
        other => panic!("unexpected error {}", other),
    }
}

#[test]
fn vm_as_value_start_and_resume() {
    let context = run(
        r#"
        var count = 0;
        fun Tick() { loop { count += 1; yield; } }
        var worker = vm_start(Tick);
        vm_resume(worker);
        vm_resume(worker);
        print(count);
        "#,
    );
    // The child works on its own copy of the globals.
    assert_eq!(context.vm().printed(), "0\n");
}
