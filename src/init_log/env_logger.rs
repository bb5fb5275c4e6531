/// Plain env_logger alternative for builds without the tracing stack.
pub fn init() {
    use chrono::Local;
    use std::io::Write;
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.module_path().unwrap_or("<unnamed>"),
                &record.args()
            )
        })
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn repeated_init_is_harmless() {
        super::init();
        super::init();
        log::info!("logger installed");
    }
}
