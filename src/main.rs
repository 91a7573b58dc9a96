fn main() {
    env_logger::init();

    let config_path = std::env::args().nth(1);

    match meshpool::run(config_path.as_deref()) {
        Ok(()) => {}
        Err(e) => {
            log::error!("Mesh pool error: {}", e.to_string())
        }
    }
}
