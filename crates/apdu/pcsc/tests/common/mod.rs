//! Common test utilities

use pcsc::{Context, Scope};

use portier_transport_pcsc::{PcscConfig, PcscReader};

/// Try to get a real PC/SC context for tests
pub fn get_pcsc_context() -> Option<Context> {
    Context::establish(Scope::User).ok()
}

/// Try to open the first reader for tests
pub fn get_test_reader() -> Option<PcscReader> {
    let context = get_pcsc_context()?;
    let readers = context.list_readers_owned().ok()?;
    let name = readers.first()?.to_string_lossy().into_owned();

    PcscReader::open(PcscConfig::default().with_reader(name)).ok()
}
