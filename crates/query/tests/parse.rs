use query::{parse, Executable};

fn parses(src: &str) -> bool {
    let mut exe = Executable::new();
    parse(&mut exe, src).is_ok()
}

#[test]
fn positive_battery() {
    for src in [
        "${.}",
        "${./hello/world}",
        "${.[*]}",
        "${.|unpack}",
        "${./hello[*]}",
        "${.[name='test']}",
        "${.[name='test']/ids[*]}",
        "${./hello/world[name='test']}",
        "${./hello/world[name = 'test']}",
        "${./hello/world[val=5]/''}",
        "${./hello/world[pi=3.1415]}",
        "${./hello/world[nope=null]}",
        "${./hello/world[s ?> '>']}",
        "${./hello/world[s !?? 'secret']}",
        "${./hello/world['this is fine'=0]}",
        "${$x/subkey}",
        "${$x[val=42]}",
        "string $with var",
        "just ;$a string, and $one var",
        "$func(0)",
        "${func(0, x)}",
        "${func(0) / subkey /'with space' | unpack | array | test(true)}",
        "$toint(42)",
        "${toint(42)}",
        "${'42'|toint}",
        "${toint('42')}",
        "${$ROOT/path/to[name == $ROOT/validnames | tolower]}",
        "${$ROOT/path/to[name == f($ROOT/validnames | tolower, '42'|toint, 'str')]}",
        "${P compact array}",
        "/rooms[open=true]/id",
        "/people[room=$ids]/name",
        "${.[0:2,5]}",
        "${.[:3]}",
        "${.[2:]}",
        "${.[keep a=b c]}",
        "${.[drop x y]}",
        "${.[key name]}",
        "${.[val >= 2]}",
    ] {
        assert!(parses(src), "expected to parse: {src}");
    }
}

#[test]
fn negative_battery() {
    for src in [
        "",
        "$",
        "${}",
        "$func(0, x)",
        "${'unterminated}",
        "${\"unterminated}",
        "${./hello/world['missing_bracket}",
        "${. [val=5]",
        "${func(0,)}",
        "${func()}",
    ] {
        assert!(!parses(src), "expected to fail: {src}");
    }
}

#[test]
fn errors_report_the_furthest_position() {
    let mut exe = Executable::new();
    let err = parse(&mut exe, "${./a/b").unwrap_err();
    assert!(err.pos >= 7, "pos was {}", err.pos);
    assert!(err.rendered.contains("^-- parse error here"));
}

#[test]
fn failed_parses_roll_back_literals() {
    let mut exe = Executable::new();
    assert!(parse(&mut exe, "${./deep/path['oops}").is_err());
    assert_eq!(exe.literals.len(), 0);
    assert!(exe.pool.is_empty(), "rolled-back literals leaked strings");

    // The executable stays usable afterwards.
    let start = parse(&mut exe, "${./ok}").unwrap();
    assert!(start >= 1);
}

#[test]
fn instruction_zero_is_a_done_sentinel() {
    let mut exe = Executable::new();
    let a = parse(&mut exe, "${.}").unwrap();
    let b = parse(&mut exe, "${.}").unwrap();
    assert!(a >= 1 && b > a);
    assert!(matches!(exe.cmds[0], query::Cmd::Done));
}

#[test]
fn escape_character_neutralizes_specials() {
    // `;$` is a literal dollar; `;;` is a literal semicolon. Both parse
    // to plain literal text.
    let mut exe = Executable::new();
    assert!(parse(&mut exe, "cost: ;$100 ;; done").is_ok());
    let rendered = exe.disasm().join("\n");
    assert!(rendered.contains("cost: $100 ; done"), "{rendered}");
}
