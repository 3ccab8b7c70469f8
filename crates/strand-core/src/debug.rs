// Byte-level dumps of streamed text, compiled in with `--features utf8-trace`.

#[cfg(feature = "utf8-trace")]
pub fn dump_str(label: &str, s: &str) {
    dump_bytes(label, s.as_bytes());
    use std::fmt::Write;
    let mut cps = String::new();
    for ch in s.chars() {
        let _ = write!(&mut cps, "U+{:04X} ", ch as u32);
    }
    tracing::trace!(target: "strand::utf8", "[{label}] cps  : {cps}");
}

#[cfg(not(feature = "utf8-trace"))]
#[inline(always)]
pub fn dump_str(_label: &str, _s: &str) {}

#[cfg(feature = "utf8-trace")]
pub fn dump_bytes(label: &str, bytes: &[u8]) {
    use std::fmt::Write;
    let mut hex = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        let _ = write!(&mut hex, "{:02X} ", b);
    }
    tracing::trace!(target: "strand::utf8", "[{label}] bytes: {hex}");
}

#[cfg(not(feature = "utf8-trace"))]
#[inline(always)]
pub fn dump_bytes(_label: &str, _bytes: &[u8]) {}
