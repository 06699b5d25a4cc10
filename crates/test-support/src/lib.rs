//! Shared helpers for Tandem tests: an in-memory [`VendorClient`] and the
//! fixture loaders.
//!
//! [`VendorClient`]: tandem_vendor::VendorClient

mod fake;

pub use fake::{FakeVendorClient, Gate};

pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use tandem_vendor::RawEvent;

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    /// Raw vendor event from `events/<name>`.
    pub fn event(name: &str) -> RawEvent {
        let json = read_or_panic(Path::new("events").join(name));
        RawEvent::from_json(&json)
            .unwrap_or_else(|error| panic!("fixture events/{name} is not valid json: {error}"))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}
