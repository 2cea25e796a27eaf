//! Useful macros.

/// Time the given expression, push `(label, duration)` to the given `Vec<(String, Duration)>` and
/// log it.
macro_rules! time {
    ($timers:ident, $label:expr, $expr:expr) => {{
        let label = String::from($label);
        let start = std::time::Instant::now();
        let result = $expr;
        let duration = std::time::Instant::now() - start;
        log::info!("{}: {:.3}s", label, duration.as_secs_f64());
        $timers.push((label, duration));
        result
    }};
}

/// Given an ordered list of path components, combine them into a path string.
macro_rules! dir {
    ($first:expr $(, $part:expr)* $(,)?) => {{
        #[allow(unused_mut)]
        let mut path = String::from($first);

        $(
            if !path.ends_with('/') {
                path.push('/');
            }
            path.push_str(&$part);
        )*

        path
    }}
}
