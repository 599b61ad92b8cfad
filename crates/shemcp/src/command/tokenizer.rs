//! Quote- and escape-aware command tokenizer.

/// Split a command string into tokens.
///
/// Rules:
/// - Whitespace outside quotes separates tokens.
/// - Single and double quotes group literally; a backslash escapes the
///   following character in any state.
/// - Unbalanced quotes are tolerated: the current token is emitted at
///   end-of-input.
///
/// Empty or whitespace-only input yields an empty list; callers that need a
/// command must treat that as an error.
pub fn tokenize(input: &str) -> Vec<String> {
    #[derive(PartialEq)]
    enum State {
        Normal,
        Single,
        Double,
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut escaped = false;
    let mut state = State::Normal;

    for c in input.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match state {
            State::Normal => match c {
                '\\' => {
                    escaped = true;
                    started = true;
                }
                '\'' => {
                    state = State::Single;
                    started = true;
                }
                '"' => {
                    state = State::Double;
                    started = true;
                }
                c if c.is_ascii_whitespace() => {
                    if started {
                        tokens.push(std::mem::take(&mut current));
                        started = false;
                    }
                }
                c => {
                    current.push(c);
                    started = true;
                }
            },
            State::Single => match c {
                '\\' => escaped = true,
                '\'' => state = State::Normal,
                c => current.push(c),
            },
            State::Double => match c {
                '\\' => escaped = true,
                '"' => state = State::Normal,
                c => current.push(c),
            },
        }
    }

    if started {
        tokens.push(current);
    }
    tokens
}
