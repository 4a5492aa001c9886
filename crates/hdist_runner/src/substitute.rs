//! Environment variable substitution for job command strings.

use std::collections::BTreeMap;

use crate::error::JobError;

/// Expands `$NAME` and `${NAME}` references from `env`.
///
/// `\$` escapes a literal dollar. `$$` is forbidden so that it cannot
/// collide with the escape convention. Undefined references are errors
/// rather than empty expansions.
pub fn substitute(input: &str, env: &BTreeMap<String, String>) -> Result<String, JobError> {
    if input.contains("$$") {
        return Err(JobError::BadSubstitution {
            input: input.to_string(),
            reason: "$$ is not allowed (no variable can be named $)".to_string(),
        });
    }

    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if chars.peek() == Some(&'$') {
                    chars.next();
                    out.push('$');
                } else {
                    out.push('\\');
                }
            }
            '$' => {
                let name = match chars.peek() {
                    Some('{') => {
                        chars.next();
                        let mut name = String::new();
                        loop {
                            match chars.next() {
                                Some('}') => break,
                                Some(c) => name.push(c),
                                None => {
                                    return Err(JobError::BadSubstitution {
                                        input: input.to_string(),
                                        reason: "unclosed ${".to_string(),
                                    })
                                }
                            }
                        }
                        name
                    }
                    Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                        let mut name = String::new();
                        while let Some(c) = chars.peek() {
                            if c.is_ascii_alphanumeric() || *c == '_' {
                                name.push(*c);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        name
                    }
                    _ => {
                        return Err(JobError::BadSubstitution {
                            input: input.to_string(),
                            reason: "dangling $".to_string(),
                        })
                    }
                };
                match env.get(&name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(JobError::UndefinedVariable {
                            name,
                            input: input.to_string(),
                        })
                    }
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "a".to_string());
        env.insert("B".to_string(), "b".to_string());
        env
    }

    fn check(want: &str, input: &str) {
        assert_eq!(want, substitute(input, &env()).unwrap(), "input: {input:?}");
    }

    fn check_fails(input: &str) {
        assert!(substitute(input, &env()).is_err(), "input: {input:?}");
    }

    #[test]
    fn plain_references() {
        check("ab", "$A$B");
        check("ax", "${A}x");
        check("a b", "$A b");
    }

    #[test]
    fn escapes() {
        check(r"${A}x", r"\${A}x");
        check(r"\${A}x", r"\\${A}x");
        check(r"\", r"\");
        check(r"\\", r"\\");
        check("a$${x}", r"${A}\$\${x}");
    }

    #[test]
    fn undefined_variable_fails() {
        check_fails("$Ax");
        check_fails("${MISSING}");
    }

    #[test]
    fn double_dollar_forbidden() {
        check_fails("$$");
        check_fails("a$$b");
    }

    #[test]
    fn dangling_dollar_fails() {
        check_fails("$ ");
        check_fails("end$");
        check_fails("$1");
    }

    #[test]
    fn unclosed_brace_fails() {
        check_fails("${A");
    }

    #[test]
    fn underscored_names() {
        let mut env = env();
        env.insert("MY_VAR_2".to_string(), "v".to_string());
        assert_eq!("v", substitute("$MY_VAR_2", &env).unwrap());
    }
}
