use flagger::{Attributes, Entity, Error, FlaggerConfig};

#[tokio::main]
pub async fn main() -> flagger::Result<()> {
    // Configure env_logger to see flagger logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("flagger")).init();

    // Print ingestion payloads instead of sending them anywhere.
    let flagger = FlaggerConfig::new("http://localhost:8080/ingest")
        .to_flagger(|url: String, body: String| async move {
            println!("POST {url}\n{body}");
            Ok::<(), Error>(())
        });
    flagger.start()?;

    // Until a configuration is installed, every flag is off.
    flagger.set_config_json(include_str!("../../tests/data/config.json"))?;

    let entity = Entity::new("42")
        .with_name("Ada")
        .with_attribute("country", "Japan");
    flagger.set_entity(Some(entity));

    if flagger.is_enabled("color-theme", None) {
        let variation = flagger.get_variation("color-theme", None);
        println!("Variation: {variation}, payload: {:?}", flagger.get_payload("color-theme", None));
    }

    flagger.track("purchase", Attributes::new(), None);

    flagger.shutdown().await;
    Ok(())
}
