use relay_gateway::{config, logger, server};

#[tokio::main]
async fn main() {
    // Log panics before they take the process down.
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        logger::error(
            "panic",
            &format!("PANIC: message='{}', location='{}'", message, location),
        );
        eprintln!("FATAL PANIC: {} at {}", message, location);
    }));

    config::install(config::Settings::from_env());
    logger::init();
    logger::info("app", "relay gateway starting");
    server::serve().await;
}
