//! Reading of line-oriented configuration files with continuation lines.
//!
//! A physical line whose first character is whitespace continues the
//! previous logical line; the whitespace run collapses to a single space.
//! Blank lines and lines whose first non-whitespace character is `#` are
//! skipped entirely, even in the middle of a continuation run. Trailing
//! comments are *not* stripped.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ContreadError {
    #[error("line {0}: first line is a continuation")]
    StartingContinuedLine(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One logical line together with the number of its first physical line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    pub lineno: usize,
    pub text: String,
}

fn is_skippable(line: &str) -> bool {
    let trimmed = line.trim_start();

    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Reads all logical lines from `reader`, resolving continuations.
pub fn logical_lines<R: Read>(reader: R) -> Result<Vec<LogicalLine>, ContreadError> {
    let mut out: Vec<LogicalLine> = Vec::new();

    for (idx, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        let lineno = idx + 1;

        if is_skippable(&line) {
            continue;
        }

        if line.starts_with(|c: char| c.is_whitespace()) {
            let Some(prev) = out.last_mut() else {
                return Err(ContreadError::StartingContinuedLine(lineno));
            };
            prev.text.truncate(prev.text.trim_end().len());
            prev.text.push(' ');
            prev.text.push_str(line.trim_start());
        } else {
            out.push(LogicalLine {
                lineno,
                text: line,
            });
        }
    }

    Ok(out)
}

pub fn logical_lines_from_file(path: &Path) -> Result<Vec<LogicalLine>, ContreadError> {
    logical_lines(File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(s: &str) -> Vec<(usize, String)> {
        logical_lines(s.as_bytes())
            .unwrap()
            .into_iter()
            .map(|l| (l.lineno, l.text))
            .collect()
    }

    #[test]
    fn plain_lines_pass_through() {
        assert_eq!(
            lines("This is the first line.\nThis is the second line.\n"),
            vec![
                (1, "This is the first line.".to_owned()),
                (2, "This is the second line.".to_owned()),
            ]
        );
    }

    #[test]
    fn first_continuation_line_is_an_error() {
        assert!(matches!(
            logical_lines(" a".as_bytes()),
            Err(ContreadError::StartingContinuedLine(1))
        ));
    }

    #[test]
    fn continuations_join_with_a_single_space() {
        let input = "\n2\n 3\n4\n 5\n 6\n7\n   8\n  9\n";

        assert_eq!(
            lines(input),
            vec![
                (2, "2 3".to_owned()),
                (4, "4 5 6".to_owned()),
                (7, "7 8 9".to_owned()),
            ]
        );
    }

    #[test]
    fn tabs_continue_too() {
        assert_eq!(
            lines("first\n\tsecond.\nthird\n\t\t\tfourth."),
            vec![(1, "first second.".to_owned()), (3, "third fourth.".to_owned())]
        );
    }

    #[test]
    fn trailing_whitespace_before_a_continuation_is_trimmed() {
        assert_eq!(lines("first   \n second\n"), vec![(1, "first second".to_owned())]);
    }

    #[test]
    fn comments_and_blanks_vanish_even_inside_continuations() {
        let input = "\n# C1\n  # c2\n4\n\n 6.\n7\n# 8\n  9\n  # 10\n  11.\n12 # not stripped.\n\n";

        assert_eq!(
            lines(input),
            vec![
                (4, "4 6.".to_owned()),
                (7, "7 9 11.".to_owned()),
                (12, "12 # not stripped.".to_owned()),
            ]
        );
    }
}
