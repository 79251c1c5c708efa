use std::process::{Command, Output};

fn graphbench(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_graphbench"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run graphbench")
}

fn result_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| l.split(", ").count() == 7)
        .map(str::to_string)
        .collect()
}

#[test]
fn non_numeric_argument_exits_before_running() {
    let output = graphbench(&["10", "1", "four"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(result_lines(&output).is_empty());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("four"), "unexpected output: {stdout}");
}

#[test]
fn zero_streams_exits_with_one() {
    let output = graphbench(&["10", "0"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(result_lines(&output).is_empty());
}

#[test]
fn valid_run_prints_one_result_line() {
    for strategy in ["streams", "graph", "graph-update", "split", "split-update"] {
        let output = graphbench(&["2", "2", "2", "4", "16", "1", "--strategy", strategy]);
        assert_eq!(output.status.code(), Some(0), "strategy {strategy}");
        let lines = result_lines(&output);
        assert_eq!(lines.len(), 1, "strategy {strategy}");
        assert!(lines[0].starts_with("2, 2, 2, 32, 16, 1, "));
        assert!(String::from_utf8_lossy(&output.stderr).contains("Validation passed"));
    }
}
