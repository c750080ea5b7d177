use clap::Args;
use colored::Colorize;
use portier_terminal::{
    AccessDecision, AccessEngine, CardHandle, FixedPin, NoPin, Pin, TerminalConfig,
    emulator::VirtualPki,
};

use crate::utils::ConsoleIndicator;

/// Holder reference of the simulated card
const SIMULATED_HOLDER: &str = "PTDEV00001";

/// Faults and parameters of the simulated card
#[derive(Args, Debug, Clone)]
pub(crate) struct SimulateArgs {
    /// PIN entered at the terminal (none when unset)
    #[arg(long)]
    pin: Option<String>,

    /// PIN the card expects (defaults to --pin)
    #[arg(long)]
    card_pin: Option<String>,

    /// Largest chunk the card returns per READ BINARY
    #[arg(long, default_value_t = 256)]
    chunk: usize,

    /// Corrupt the card's reply to VERIFY
    #[arg(long)]
    tamper: bool,

    /// Refuse the secure channel handshake
    #[arg(long)]
    fail_handshake: bool,

    /// Trust an anchor unrelated to the card's issuer
    #[arg(long)]
    untrusted: bool,
}

/// Evaluate a virtual card and print the assessment
pub(crate) fn simulate_command(
    config: &TerminalConfig,
    args: &SimulateArgs,
) -> eyre::Result<Option<AccessDecision>> {
    let pki = VirtualPki::generate()?;
    let anchor = if args.untrusted {
        VirtualPki::generate()?.anchor()
    } else {
        pki.anchor()
    };

    let mut card = pki.issue_card(SIMULATED_HOLDER)?.with_chunk_limit(args.chunk);
    if let Some(pin) = args.card_pin.as_deref().or(args.pin.as_deref()) {
        card = card.with_pin(pin);
    }
    if args.tamper {
        card = card.tampering_pin_response();
    }
    if args.fail_handshake {
        card = card.failing_handshake();
    }

    let engine = AccessEngine::new(anchor, ConsoleIndicator::new())
        .with_blink_interval(config.timing.blink_interval());
    let mut engine = match args.pin.as_deref() {
        Some(pin) => engine.with_pin_source(FixedPin::new(Pin::try_from(pin)?)),
        None => engine.with_pin_source(NoPin),
    };

    let timeout = config.timing.exchange_timeout();
    let mut handle = CardHandle::open("virtual", card.transport(), timeout)?;
    let assessment = engine.assess(&mut handle);
    handle.close();

    let decision = match assessment.decision {
        AccessDecision::Granted => "granted".green().bold(),
        AccessDecision::Denied => "denied".red().bold(),
    };
    println!("Access {decision}");
    if let Some(cause) = assessment.cause {
        println!("  cause:    {cause}");
    }
    println!("  reached:  {}", assessment.reached);
    if let Some(path) = &assessment.identity_path {
        println!("  identity: {path}");
    }
    println!("  commands: {}", card.commands().len());
    println!("  elapsed:  {:?}", assessment.elapsed);

    Ok(Some(assessment.decision))
}
