//! Command-line splitting and `%h`/`%p` templates for command hops.

use std::io;

use crate::scheme::split_host_port;

/// Split a command line into argv, shell style.
///
/// Whitespace separates words; single quotes are literal; double quotes allow
/// backslash escapes; a backslash outside quotes escapes the next character.
pub fn split_command(line: &str) -> io::Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(unterminated("single")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(unterminated("double")),
                        },
                        Some(c) => word.push(c),
                        None => return Err(unterminated("double")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    word.push(c);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

fn unterminated(kind: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unterminated {kind} quote in command"),
    )
}

/// A command whose arguments may reference the dial target.
///
/// `%h` expands to the target host, `%p` to its port and `%%` to a literal `%`.
/// Unix targets have no port; `%h` expands to the whole path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    argv: Vec<String>,
}

impl CommandTemplate {
    /// Parse a template command line.
    pub fn parse(line: &str) -> io::Result<Self> {
        let argv = split_command(line)?;
        if argv.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
        }
        Ok(Self { argv })
    }

    /// Expand the template for a dial target.
    pub fn format(&self, network: &str, address: &str) -> Vec<String> {
        let (host, port) = if network.starts_with("unix") {
            (address, "")
        } else {
            split_host_port(address).unwrap_or((address, ""))
        };
        self.argv
            .iter()
            .map(|arg| expand(arg, host, port))
            .collect()
    }
}

fn expand(arg: &str, host: &str, port: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut chars = arg.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('h') => {
                out.push_str(host);
                chars.next();
            }
            Some('p') => {
                out.push_str(port);
                chars.next();
            }
            Some('%') => {
                out.push('%');
                chars.next();
            }
            _ => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command_quotes() {
        assert_eq!(
            split_command(r#"ssh -o 'ProxyCommand none' "host name" a\ b"#).unwrap(),
            vec!["ssh", "-o", "ProxyCommand none", "host name", "a b"]
        );
        assert_eq!(split_command("  nc   %h  %p ").unwrap(), vec!["nc", "%h", "%p"]);
        assert_eq!(split_command("echo ''").unwrap(), vec!["echo", ""]);
        assert!(split_command("").unwrap().is_empty());
    }

    #[test]
    fn test_split_command_unterminated() {
        let err = split_command("echo 'oops").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_template_format_tcp() {
        let tpl = CommandTemplate::parse("nc %h %p").unwrap();
        assert_eq!(tpl.format("tcp", "example.com:80"), vec!["nc", "example.com", "80"]);
        assert_eq!(tpl.format("tcp6", "[::1]:22"), vec!["nc", "::1", "22"]);
    }

    #[test]
    fn test_template_format_unix_and_literal_percent() {
        let tpl = CommandTemplate::parse("nc -U %h --tag=100%%").unwrap();
        assert_eq!(
            tpl.format("unix", "/run/app.sock"),
            vec!["nc", "-U", "/run/app.sock", "--tag=100%"]
        );
    }

    #[test]
    fn test_template_rejects_empty() {
        assert!(CommandTemplate::parse("   ").is_err());
    }
}
