//! Request text in the credential helper's line format

/// Render `pairs` as `key=value` lines followed by the terminating blank line
pub fn request(pairs: &[(&str, &str)]) -> String {
  let mut text: String = pairs.iter().map(|(key, value)| format!("{key}={value}\n")).collect();
  text.push('\n');
  text
}

/// A `get`/`erase` request for `https://<host>`
pub fn https_query(host: &str) -> String {
  request(&[("protocol", "https"), ("host", host)])
}
