/// Replace `${ENV_VAR}` placeholders in config text with the variable's
/// value. Unknown variables and unterminated placeholders pass through
/// untouched, so a literal `${...}` in a password survives.
pub fn substitute_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            // Empty placeholder: emit it literally and keep scanning.
            Some(0) => {
                out.push_str("${}");
                rest = &after[1..];
            },
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    },
                }
                rest = &after[end + 1..];
            },
            None => {
                // No closing brace: keep the rest literally.
                out.push_str(&rest[start..]);
                return out;
            },
        }
    }

    out.push_str(rest);
    out
}
