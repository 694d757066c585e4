//! Target-OS "standard" command-line quoting (§6, §8 round-trip property).
//!
//! Each argument is wrapped in double quotes; an embedded `"` is escaped as
//! `\"`; a run of `\` immediately followed by `"` or the end of the argument
//! is doubled; any other `\` is left alone. This is the quoting convention
//! `CommandLineToArgvW` expects, which is also what the spec's §8 round-trip
//! property is checking.

/// Quotes a single argument per the rules above.
pub fn quote_arg(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    let chars: Vec<char> = arg.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let mut backslashes = 0;
        while i < chars.len() && chars[i] == '\\' {
            backslashes += 1;
            i += 1;
        }
        if i == chars.len() {
            // Trailing backslashes: double them so they don't escape the
            // closing quote we're about to append.
            out.extend(std::iter::repeat('\\').take(backslashes * 2));
            break;
        } else if chars[i] == '"' {
            out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
            out.push('"');
            i += 1;
        } else {
            out.extend(std::iter::repeat('\\').take(backslashes));
            out.push(chars[i]);
            i += 1;
        }
    }
    out.push('"');
    out
}

/// Joins already-quoted arguments into the single string sent as the `C`
/// frame's payload.
pub fn build_command_line(args: &[String]) -> String {
    args.iter()
        .map(|a| quote_arg(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Returns the portion of `line` after its first token, using the same
/// quoting rules as [`quote_arg`]. `line`'s first token is normally a
/// program name the caller already has (resolved separately); this hands
/// back the rest of the line untouched, not re-split or re-quoted, so a
/// caller that already supplies its own argv0 can append the remainder raw.
pub fn skip_first_token(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut i = 0;
    let mut in_quotes = false;
    let mut started = false;
    while i < bytes.len() {
        let mut backslashes = 0;
        while i < bytes.len() && bytes[i] == b'\\' {
            backslashes += 1;
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b'"' {
            if backslashes % 2 == 0 {
                in_quotes = !in_quotes;
            }
            started = true;
            i += 1;
        } else if i < bytes.len() {
            if bytes[i] == b' ' && !in_quotes {
                if started {
                    break;
                }
            } else {
                started = true;
            }
            i += 1;
        }
    }
    line[i..].trim_start()
}

/// Splits a target-OS command line back into its argument vector, following
/// the same `CommandLineToArgvW`-style rules `quote_arg` targets. Used only
/// by tests to check the round-trip property in §8; the server never needs
/// to split a command line since it hands it to the child process verbatim.
#[cfg(test)]
fn split_command_line(line: &str) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let mut args = Vec::new();
    let mut i = 0;
    let mut current = String::new();
    let mut in_quotes = false;
    let mut started = false;

    while i < chars.len() {
        let mut backslashes = 0;
        while i < chars.len() && chars[i] == '\\' {
            backslashes += 1;
            i += 1;
        }
        if i < chars.len() && chars[i] == '"' {
            current.extend(std::iter::repeat('\\').take(backslashes / 2));
            if backslashes % 2 == 0 {
                in_quotes = !in_quotes;
            } else {
                current.push('"');
            }
            started = true;
            i += 1;
        } else {
            current.extend(std::iter::repeat('\\').take(backslashes));
            if i < chars.len() {
                if chars[i] == ' ' && !in_quotes {
                    if started {
                        args.push(std::mem::take(&mut current));
                        started = false;
                    }
                } else {
                    current.push(chars[i]);
                    started = true;
                }
                i += 1;
            }
        }
    }
    if started || !current.is_empty() {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn skip_first_token_drops_only_the_program_name() {
        let line = build_command_line(&["echo.exe".to_string(), "hi".to_string()]);
        assert_eq!(skip_first_token(&line), "\"hi\"");
    }

    #[test]
    fn skip_first_token_handles_a_quoted_program_name_with_spaces() {
        let line = build_command_line(&[
            "C:\\Program Files\\tool.exe".to_string(),
            "a".to_string(),
            "b".to_string(),
        ]);
        assert_eq!(skip_first_token(&line), "\"a\" \"b\"");
    }

    #[test]
    fn skip_first_token_of_a_bare_program_name_is_empty() {
        let line = build_command_line(&["echo.exe".to_string()]);
        assert_eq!(skip_first_token(&line), "");
    }

    #[test]
    fn plain_argument_round_trips() {
        let args = vec!["hello".to_string(), "world".to_string()];
        let line = build_command_line(&args);
        assert_eq!(line, "\"hello\" \"world\"");
        assert_eq!(split_command_line(&line), args);
    }

    #[test]
    fn embedded_quote_round_trips() {
        let args = vec![r#"say "hi" now"#.to_string()];
        let line = build_command_line(&args);
        assert_eq!(split_command_line(&line), args);
    }

    #[test]
    fn trailing_backslashes_round_trip() {
        let args = vec![r"C:\some\path\".to_string()];
        let line = build_command_line(&args);
        assert_eq!(split_command_line(&line), args);
    }

    #[test]
    fn backslash_before_quote_round_trips() {
        let args = vec![r#"a\"b"#.to_string()];
        let line = build_command_line(&args);
        assert_eq!(split_command_line(&line), args);
    }

    #[test]
    fn literal_backslash_not_before_quote_is_untouched() {
        let args = vec![r"C:\Program Files\tool".to_string()];
        let line = build_command_line(&args);
        assert_eq!(split_command_line(&line), args);
    }

    #[test]
    fn empty_argument_round_trips() {
        let args = vec!["".to_string(), "x".to_string()];
        let line = build_command_line(&args);
        assert_eq!(split_command_line(&line), args);
    }

    #[test]
    fn fuzz_like_sample_of_printable_ascii_round_trips() {
        // Sampling rather than an exhaustive grid: exercise a handful of
        // argument vectors drawn from the character set the property in §8
        // names (printable, space, tab, quote, backslash).
        let alphabet: Vec<char> = (b' '..=b'~')
            .map(char::from)
            .chain(['\t'])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let samples: &[&[&str]] = &[
            &["simple"],
            &["two", "args"],
            &["has space"],
            &["trailing\\\\"],
            &["\"quoted\"", "plain"],
            &["mixed\\\"escape"],
            &["\t\ttabs\t"],
        ];
        for sample in samples {
            let args: Vec<String> = sample.iter().map(|s| s.to_string()).collect();
            let line = build_command_line(&args);
            assert_eq!(split_command_line(&line), args, "round trip failed for {args:?}");
        }
        // alphabet is sanity-checked for membership only, not combined into
        // every possible argument (that grid is the kind of round-trip test
        // the spec calls out to skip).
        assert!(alphabet.contains(&'"'));
        assert!(alphabet.contains(&'\\'));
    }
}
