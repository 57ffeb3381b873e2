/// Support files copied into every session's `+engine_pkg` package
/// directory. The engine evaluates `bootstrap.m` at startup; the other
/// files are helpers the tool pipelines call by package-qualified name.
/// The contents are opaque to the server.
pub fn get_all() -> Vec<(&'static str, &'static [u8])> {
    vec![
        ("bootstrap.m", include_bytes!("../support/bootstrap.m")),
        ("check_code.m", include_bytes!("../support/check_code.m")),
        ("run_tests.m", include_bytes!("../support/run_tests.m")),
    ]
}
