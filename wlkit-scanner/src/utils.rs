pub fn snake_to_pascal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());

    for word in s.split('_') {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.push_str(chars.as_str());
        }
    }

    out
}

/// Turn a protocol name into a module identifier.
pub fn module_name(s: &str) -> String {
    s.replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pascal_case() {
        assert_eq!(snake_to_pascal("wl_display"), "WlDisplay");
        assert_eq!(snake_to_pascal("zwlr_layer_shell_v1"), "ZwlrLayerShellV1");
        assert_eq!(snake_to_pascal("single"), "Single");
        assert_eq!(snake_to_pascal(""), "");
    }

    #[test]
    fn module_names() {
        assert_eq!(module_name("xdg-shell"), "xdg_shell");
        assert_eq!(module_name("wayland"), "wayland");
    }
}
