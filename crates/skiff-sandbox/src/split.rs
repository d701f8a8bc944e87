//! Splitting of multi-statement bash scripts into logical commands.

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

#[derive(Clone)]
struct Heredoc {
    terminator: String,
    strip_tabs: bool,
}

/// Splits `script` at newlines that end a top-level command.
///
/// A newline inside single or double quotes, inside a heredoc body, or
/// escaped by a trailing backslash does not split. Escaped newlines are
/// removed together with their backslash. Heredoc bodies stay attached to the
/// command that opened them. Each command is trimmed; empty ones are dropped.
pub fn split_bash_commands(script: &str) -> Vec<String> {
    let chars: Vec<char> = script.chars().collect();
    let mut commands = Vec::new();
    let mut current = String::new();
    let mut quote = Quote::None;
    let mut pending: Vec<Heredoc> = Vec::new();
    let mut body: Option<Heredoc> = None;
    let mut i = 0;

    while i < chars.len() {
        if let Some(doc) = &body {
            let line_end = chars[i..]
                .iter()
                .position(|&c| c == '\n')
                .map_or(chars.len(), |p| i + p);
            let line: String = chars[i..line_end].iter().collect();
            current.push_str(&line);
            i = line_end;
            let candidate = if doc.strip_tabs {
                line.trim_start_matches('\t')
            } else {
                line.as_str()
            };
            if candidate == doc.terminator {
                body = (!pending.is_empty()).then(|| pending.remove(0));
                if body.is_some() && i < chars.len() {
                    current.push('\n');
                    i += 1;
                }
            } else if i < chars.len() {
                current.push('\n');
                i += 1;
            }
            continue;
        }

        let c = chars[i];
        match quote {
            Quote::Single => {
                current.push(c);
                if c == '\'' {
                    quote = Quote::None;
                }
            }
            Quote::Double => {
                current.push(c);
                if c == '\\' {
                    if let Some(&next) = chars.get(i + 1) {
                        current.push(next);
                        i += 1;
                    }
                } else if c == '"' {
                    quote = Quote::None;
                }
            }
            Quote::None => match c {
                '\\' => match chars.get(i + 1) {
                    Some('\n') => i += 1,
                    Some(&next) => {
                        current.push(c);
                        current.push(next);
                        i += 1;
                    }
                    None => current.push(c),
                },
                '\'' => {
                    quote = Quote::Single;
                    current.push(c);
                }
                '"' => {
                    quote = Quote::Double;
                    current.push(c);
                }
                '#' if starts_word(&current) => {
                    let line_end = chars[i..]
                        .iter()
                        .position(|&c| c == '\n')
                        .map_or(chars.len(), |p| i + p);
                    current.extend(&chars[i..line_end]);
                    i = line_end;
                    continue;
                }
                '<' if !current.ends_with('<') => {
                    if let Some((doc, consumed)) = parse_heredoc_operator(&chars[i..]) {
                        current.extend(&chars[i..i + consumed]);
                        pending.push(doc);
                        i += consumed;
                        continue;
                    }
                    current.push(c);
                }
                '\n' => {
                    if pending.is_empty() {
                        flush(&mut current, &mut commands);
                    } else {
                        current.push('\n');
                        body = Some(pending.remove(0));
                    }
                }
                _ => current.push(c),
            },
        }
        i += 1;
    }

    flush(&mut current, &mut commands);
    commands
}

fn flush(current: &mut String, commands: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        commands.push(trimmed.to_owned());
    }
    current.clear();
}

fn starts_word(current: &str) -> bool {
    current.chars().last().is_none_or(char::is_whitespace)
        || current.ends_with(';')
        || current.ends_with('&')
        || current.ends_with('|')
}

/// Parses `<<TOKEN`, `<<-TOKEN`, `<<'TOKEN'` or `<<"TOKEN"` at the start of
/// `input`. Here-strings (`<<<`) are not heredocs.
fn parse_heredoc_operator(input: &[char]) -> Option<(Heredoc, usize)> {
    if input.len() < 3 || input[0] != '<' || input[1] != '<' || input[2] == '<' {
        return None;
    }
    let mut j = 2;
    let strip_tabs = input.get(j) == Some(&'-');
    if strip_tabs {
        j += 1;
    }
    while input.get(j).is_some_and(|c| *c == ' ' || *c == '\t') {
        j += 1;
    }
    let quote = match input.get(j) {
        Some(&q @ ('\'' | '"')) => {
            j += 1;
            Some(q)
        }
        _ => None,
    };
    let start = j;
    while input
        .get(j)
        .is_some_and(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || *c == '.')
    {
        j += 1;
    }
    if j == start {
        return None;
    }
    let terminator: String = input[start..j].iter().collect();
    if let Some(q) = quote {
        if input.get(j) != Some(&q) {
            return None;
        }
        j += 1;
    }
    Some((
        Heredoc {
            terminator,
            strip_tabs,
        },
        j,
    ))
}
