use eyre::OptionExt;
use portier_apdu::CardReader;
use portier_terminal::{
    AccessDecision, AccessEngine, FixedPin, NoPin, Pin, Terminal, TerminalConfig,
    config::PinMode,
};
use portier_transport_pcsc::{PcscConfig, PcscReader, ShareMode};
use tracing::info;

use crate::utils::{ConsoleIndicator, PinPad};

/// Run the terminal loop on a PC/SC reader until Ctrl-C
pub(crate) async fn run_command(
    mut config: TerminalConfig,
    reader: Option<String>,
    pin_pad: bool,
) -> eyre::Result<()> {
    if reader.is_some() {
        config.reader.name = reader;
    }
    if pin_pad {
        config.pin.mode = PinMode::Pad;
    }

    let mut terminal = terminal(&config)?;
    let stop = terminal.stop_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping after the current cycle");
            stop.stop();
        }
    });

    let summary = tokio::task::spawn_blocking(move || terminal.start()).await?;
    println!(
        "{} cycles, {} granted, {} denied",
        summary.cycles, summary.granted, summary.denied
    );

    Ok(())
}

/// Evaluate the next card presented to a PC/SC reader
pub(crate) async fn check_command(
    mut config: TerminalConfig,
    reader: Option<String>,
    pin: Option<String>,
) -> eyre::Result<Option<AccessDecision>> {
    if reader.is_some() {
        config.reader.name = reader;
    }
    if pin.is_some() {
        config.pin.mode = PinMode::Fixed;
        config.pin.value = pin;
    }

    let mut terminal = terminal(&config)?;
    let stop = terminal.stop_handle();
    println!("Present a card to {}", terminal.reader().name());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let decision = tokio::task::spawn_blocking(move || terminal.run_once()).await?;
    match decision {
        Some(decision) => println!("Access {decision}"),
        None => println!("No card presented"),
    }

    Ok(decision)
}

fn terminal(config: &TerminalConfig) -> eyre::Result<Terminal<PcscReader>> {
    let mut pcsc = PcscConfig::new();
    if let Some(name) = &config.reader.name {
        pcsc = pcsc.with_reader(name.clone());
    }
    if config.reader.exclusive {
        pcsc = pcsc.with_share_mode(ShareMode::Exclusive);
    }
    let reader = PcscReader::open(pcsc)?;
    info!(reader = reader.name(), "Using reader");

    Ok(Terminal::new(reader, engine(config)?)
        .with_poll_interval(config.timing.poll_interval())
        .with_exchange_timeout(config.timing.exchange_timeout()))
}

/// Build the access engine described by `config`
fn engine(config: &TerminalConfig) -> eyre::Result<AccessEngine> {
    let engine = AccessEngine::new(config.trust_anchor()?, ConsoleIndicator::new())
        .with_credential_reader(config.credential_reader()?)
        .with_blink_interval(config.timing.blink_interval());

    Ok(match config.pin.mode {
        PinMode::None => engine.with_pin_source(NoPin),
        PinMode::Fixed => {
            let value = config
                .pin
                .value
                .as_deref()
                .ok_or_eyre("pin.value is required when pin.mode is \"fixed\"")?;
            engine.with_pin_source(FixedPin::new(Pin::try_from(value)?))
        }
        PinMode::Pad => engine.with_pin_source(PinPad::stdin(config.pin.entry_timeout())?),
    })
}
