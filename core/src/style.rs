use std::collections::BTreeMap;

use colored::{Color, ColoredString, Colorize};
use crossterm::terminal;

use crate::report::{RowOutcome, SuiteSummary};
use crate::testing::{FailureReason, TestCase, TestVerdict, Termination};

#[macro_export]
macro_rules! print_success {
    ($fmt:literal, $($e:tt)*) => {
        use ::colored::Colorize as _;
        println!("{}", format!($fmt, $($e)*).green())
    }
}

pub fn is_truecolor_supported() -> bool {
    let Ok(v) = std::env::var("COLORTERM") else {
        return false
    };
    matches!(v.as_str(), "truecolor" | "24bit")
}

pub trait ColorTheme {
    fn color(&self) -> Color;
}

impl ColorTheme for log::Level {
    fn color(&self) -> Color {
        use log::Level::*;
        match self {
            Error => Color::BrightRed,
            Warn => Color::BrightYellow,
            Info => Color::Cyan,
            Debug => Color::Magenta,
            Trace => Color::Blue,
        }
    }
}

/// Short per-test badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum Mark {
    #[strum(serialize = "PASS")]
    Pass,
    #[strum(serialize = "FAIL")]
    Fail,
    #[strum(serialize = "TIME")]
    TimedOut,
    #[strum(serialize = "LIMIT")]
    Limit,
    #[strum(serialize = "CRASH")]
    Crash,
}

impl Mark {
    pub fn of(v: &TestVerdict) -> Self {
        if v.passed {
            return Mark::Pass;
        }
        match v.outcome.termination {
            Termination::TimedOut => Mark::TimedOut,
            Termination::ResourceExceeded { .. } => Mark::Limit,
            Termination::Crashed { .. } => Mark::Crash,
            Termination::Exited { .. } => Mark::Fail,
        }
    }
}

impl ColorTheme for Mark {
    fn color(&self) -> Color {
        use Mark::*;
        if !self::is_truecolor_supported() {
            return match self {
                Pass => Color::Green,
                Fail => Color::Yellow,
                TimedOut => Color::Red,
                Limit => Color::Blue,
                Crash => Color::Magenta,
            };
        }

        match self {
            Pass => Color::TrueColor {
                r: 30,
                g: 180,
                b: 40,
            },
            Fail => Color::TrueColor {
                r: 210,
                g: 138,
                b: 4,
            },
            TimedOut => Color::TrueColor {
                r: 220,
                g: 42,
                b: 42,
            },
            Limit => Color::TrueColor {
                r: 40,
                g: 110,
                b: 220,
            },
            Crash => Color::TrueColor {
                r: 171,
                g: 40,
                b: 200,
            },
        }
    }
}

pub fn mark_icon(mark: Mark) -> ColoredString {
    let fg = if is_truecolor_supported() {
        Color::TrueColor {
            r: 255,
            g: 255,
            b: 255,
        }
    } else {
        Color::BrightBlack
    };
    format!(" {:<5} ", mark.to_string())
        .on_color(mark.color())
        .bold()
        .color(fg)
}

pub fn verdict_line(v: &TestVerdict) -> String {
    format!(
        "Test {} ... {} [{}ms]",
        v.name,
        mark_icon(Mark::of(v)),
        v.outcome.duration.as_millis()
    )
}

pub fn count_marks(verdicts: &[TestVerdict]) -> BTreeMap<Mark, usize> {
    verdicts.iter().fold(BTreeMap::new(), |mut count, v| {
        *count.entry(Mark::of(v)).or_default() += 1;
        count
    })
}

pub fn print_run_summary(verdicts: &[TestVerdict]) {
    let bar = "-".repeat(5);
    print!("{} ", bar);

    let count = self::count_marks(verdicts);

    let num_total = verdicts.len();
    let num_passed = count.get(&Mark::Pass).copied().unwrap_or(0);
    let num_failed = num_total - num_passed;

    if num_passed == num_total {
        let msg = format!("All {} tests passed ✨", num_total);
        print!("{}", msg.green());
    } else {
        let summary_msg = if num_passed > 0 {
            format!("{}/{} tests failed 💣", num_failed, num_total)
        } else {
            format!("All {} tests failed 💀", num_total)
        };

        let detail_msg = count
            .iter()
            .filter(|(&mark, _)| mark != Mark::Pass)
            .map(|(&mark, &cnt)| {
                format!(
                    "{}{}{}",
                    self::mark_icon(mark),
                    "x".dimmed(),
                    cnt.to_string().bold().bright_white(),
                )
            })
            .collect::<Vec<String>>()
            .join(", ");

        print!("{} ({})", summary_msg.bright_red(), detail_msg);
    }

    println!(" {}", bar);
    println!("Passed {}/{}", num_passed, num_total);
}

const BOLD_LINE: &str = "━";
const THIN_LINE: &str = "─";

fn print_sub_title(s: &str, cols: usize) {
    println!(
        "{}{}",
        s.cyan().bold(),
        THIN_LINE
            .repeat(cols.saturating_sub(s.len() + 1))
            .bright_black(),
    )
}

fn print_lines(entire_str: &str) {
    let lines: Vec<_> = entire_str.lines().collect();
    if lines.is_empty() {
        println!("{}", "<EMPTY>".magenta().dimmed());
        return;
    }
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_end();
        print!("{}", trimmed);

        let num_trailing_whitespace = line.len() - trimmed.len();
        if num_trailing_whitespace > 0 {
            print!(
                "{}{}",
                " ".repeat(num_trailing_whitespace).on_red(),
                "(Trailing whitespace)".bright_red().bold()
            );
        }

        let is_last_line = i + 1 == lines.len();
        if is_last_line && !entire_str.ends_with('\n') {
            print!("{}", " Missing new line ".on_yellow().black().bold());
        }

        println!();
    }
}

fn reason_text(v: &TestVerdict) -> String {
    let Some(e) = &v.explanation else {
        return String::new();
    };
    match (e.reason, v.outcome.termination) {
        (FailureReason::ResourceExceeded, _) => match e.resource {
            Some(r) => format!("resource limit exceeded ({})", r),
            None => "resource limit exceeded".into(),
        },
        (FailureReason::ExitCode | FailureReason::ExitCodeAndStdout, Termination::Crashed { signal }) => {
            format!("{}: killed by signal {}", e.reason, signal)
        }
        (FailureReason::ExitCode | FailureReason::ExitCodeAndStdout, Termination::Exited { code }) => {
            format!(
                "{}: expected exit code {}, got {}",
                e.reason,
                e.expected_exit_code.unwrap_or_default(),
                code
            )
        }
        (reason, _) => reason.to_string(),
    }
}

pub fn print_verdict_detail(v: &TestVerdict, case: &TestCase) {
    let (cols, _) = terminal::size().unwrap_or((40, 40));
    let cols = cols as usize;
    let bold_bar = BOLD_LINE.repeat(cols).blue().bold();

    println!(
        "\n{}: {} [{}ms] {}\n{}",
        v.name.color(Color::BrightYellow).bold(),
        mark_icon(Mark::of(v)),
        v.outcome.duration.as_millis(),
        reason_text(v).bright_red(),
        bold_bar,
    );

    for (i, accepted) in case.expected.values().iter().enumerate() {
        let title = match case.expected.values().len() {
            1 => "[expected]".to_owned(),
            _ => format!("[expected #{}]", i + 1),
        };
        print_sub_title(&title, cols);
        print_lines(accepted);
    }

    print_sub_title("[stdout]", cols);
    print_lines(&v.outcome.stdout);
    if v.outcome.stdout_truncated {
        println!("{}", "<TRUNCATED>".magenta().dimmed());
    }

    if !v.outcome.stderr.is_empty() {
        print_sub_title("[stderr]", cols);
        print!("{}", v.outcome.stderr);
        if !v.outcome.stderr.ends_with('\n') {
            println!();
        }
    }

    println!("{}", bold_bar);
}

fn outcome_label(outcome: &RowOutcome) -> ColoredString {
    match outcome {
        RowOutcome::FullPass => "full-pass".green(),
        RowOutcome::Partial => "partial".yellow(),
        RowOutcome::NoPass => "no-pass".bright_red(),
        RowOutcome::CompileFailed => "compile-failed".red(),
        RowOutcome::NotRun { status } => format!("not-run ({})", status).magenta(),
        RowOutcome::Ungraded { .. } => "ungraded".bright_black(),
    }
}

/// Fixed-width table, one row per submission, then a TOTAL row.
pub fn print_summary_table(summary: &SuiteSummary) {
    let id_width = summary
        .rows
        .iter()
        .map(|r| r.id.chars().count())
        .chain([7])
        .max()
        .unwrap_or(7);

    println!(
        "{}",
        format!("{:<w$}  {:>5}  {:>5}  {}", "Student", "Pass", "Total", "Result", w = id_width).bold()
    );
    for row in &summary.rows {
        println!(
            "{:<w$}  {:>5}  {:>5}  {}",
            row.id,
            row.passed,
            row.total,
            outcome_label(&row.outcome),
            w = id_width
        );
    }

    let t = &summary.totals;
    let totals = format!(
        "{} full / {} partial / {} no-pass / {} compile-failed / {} not-run / {} ungraded",
        t.full_pass, t.partial, t.no_pass, t.compile_failed, t.not_run, t.ungraded
    );
    println!(
        "{}",
        format!(
            "{:<w$}  {:>5}  {:>5}  {}",
            "TOTAL",
            t.passed_tests,
            t.total_tests,
            totals,
            w = id_width
        )
        .bold()
    );
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use maplit::btreemap;

    use super::*;
    use crate::testing::{ExecutionOutcome, ResourceKind};

    fn verdict(passed: bool, termination: Termination) -> TestVerdict {
        TestVerdict {
            name: "t".into(),
            passed,
            outcome: ExecutionOutcome {
                termination,
                stdout: String::new(),
                stderr: String::new(),
                stdout_truncated: false,
                stderr_truncated: false,
                duration: Duration::from_millis(3),
            },
            explanation: None,
        }
    }

    #[test]
    fn marks_follow_termination() {
        let verdicts = [
            verdict(true, Termination::Exited { code: 0 }),
            verdict(true, Termination::Crashed { signal: 11 }),
            verdict(false, Termination::Exited { code: 0 }),
            verdict(false, Termination::TimedOut),
            verdict(
                false,
                Termination::ResourceExceeded {
                    resource: ResourceKind::Memory,
                },
            ),
            verdict(false, Termination::Crashed { signal: 11 }),
            verdict(false, Termination::TimedOut),
        ];

        assert_eq!(
            count_marks(&verdicts),
            btreemap! {
                Mark::Pass => 2,
                Mark::Fail => 1,
                Mark::TimedOut => 2,
                Mark::Limit => 1,
                Mark::Crash => 1,
            }
        );
    }
}
