use colored::Colorize;
use portier_transport_pcsc::list_readers;

/// List PC/SC readers and whether a card is present
pub(crate) fn list_command() -> eyre::Result<()> {
    let readers = list_readers()?;

    if readers.is_empty() {
        println!("No readers found");
        return Ok(());
    }

    println!("Available readers:");
    for (index, reader) in readers.iter().enumerate() {
        let presence = if reader.has_card() {
            "card present".green()
        } else {
            "empty".dimmed()
        };
        println!("  {}. {} ({presence})", index + 1, reader.name().bold());

        if let Some(atr) = reader.atr() {
            println!("     ATR: {}", hex::encode_upper(atr));
        }
    }

    Ok(())
}
