use chatline::core::config::{load_config, resolve, ChatlineConfig};
use chatline::{AttachmentMeta, Messenger, ParticipantId, ThreadUpdate};
use clap::Parser;
use log::{info, warn};
use simplelog::{ConfigBuilder, LevelFilter, WriteLogger};
use std::fs::File;
use std::time::Duration;

/// Size reported for the demo attachment.
const DEMO_ATTACHMENT_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "chatline", about = "Runs a scripted conversation through the delivery pipeline")]
struct Args {
    /// Who the conversation is with
    #[arg(short, long, default_value = "alice")]
    contact: String,

    /// Delay before the scheduled message goes out
    #[arg(short, long, default_value_t = 2)]
    schedule_secs: u64,

    /// Also send an attachment of this MIME type (e.g. image/png)
    #[arg(short, long)]
    attachment: Option<String>,

    /// Disable the contact's automatic reply
    #[arg(long)]
    no_auto_reply: bool,
}

fn print_update(update: &ThreadUpdate) {
    match serde_json::to_string(update) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("Could not serialize update: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    dotenv::dotenv().ok();

    // Initialize file logger first - writes to chatline.log in current directory.
    // stdout carries the update stream. The level is narrowed once the
    // config is resolved.
    let log_config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .build();

    if let Ok(log_file) = File::create("chatline.log") {
        let _ = WriteLogger::init(LevelFilter::Trace, log_config, log_file);
    }

    let loaded = load_config();
    let config = resolve(
        loaded.as_ref().unwrap_or(&ChatlineConfig::default()),
        args.no_auto_reply.then_some(false),
    );
    log::set_max_level(config.log_level);

    if let Err(e) = &loaded {
        warn!("Ignoring config file: {}", e);
    }
    info!("Chatline starting up with config: {:?}", config);

    let messenger = Messenger::from_config(&config);
    let contact = ParticipantId::from(args.contact.as_str());
    let thread = messenger.create_thread(args.contact.clone(), [contact]);
    let subscription = messenger.subscribe(&thread, print_update)?;

    messenger.send(&thread, messenger.draft("Hey! Are we still on for tomorrow?"))?;

    if let Some(mime) = &args.attachment {
        let extension = mime.rsplit('/').next().unwrap_or("bin");
        let meta = AttachmentMeta::new(format!("attachment.{extension}"), mime.clone(), DEMO_ATTACHMENT_BYTES);
        messenger.send(&thread, messenger.draft("Here is the file").with_attachment(meta))?;
    }

    let delay = Duration::from_secs(args.schedule_secs.max(1));
    messenger.schedule_in(&thread, messenger.draft("Scheduled reminder"), delay)?;
    let doomed = messenger.schedule_in(&thread, messenger.draft("Never mind"), delay)?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    messenger.cancel(&doomed)?;

    messenger.settle().await;
    let read = messenger.mark_read(&thread)?;
    info!("Marked {} messages read", read);

    subscription.unsubscribe();
    messenger.shutdown();
    Ok(())
}
