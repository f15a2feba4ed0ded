pub const DEFAULT_DEFINE: &str = "SECBOOT_CRYPTO_SCHEME";

/// Value of the first `#define NAME VALUE` line for `name`.
pub fn find_define(text: &str, name: &str) -> Option<String> {
    text.lines()
        .filter(|line| line.contains(name))
        .find_map(|line| {
            let mut words = line.split_whitespace().skip(1);
            match (words.next(), words.next()) {
                (Some(word), Some(value)) if word == name => Some(value.to_string()),
                _ => None,
            }
        })
}
