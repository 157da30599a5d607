use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use flagger::{
    evaluate, AttributeValue, Attributes, Entity, Error, FlaggerConfig, FlaggerConfiguration,
    Group, Reason,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn load_configuration() -> FlaggerConfiguration {
    FlaggerConfiguration::from_json(include_str!("data/config.json")).unwrap()
}

#[test]
fn parses_configuration_fixture() {
    let configuration = load_configuration();

    assert_eq!(configuration.hash_key, "a0b1c2d3");
    assert_eq!(configuration.sdk_config.ingestion_interval_seconds, 30);
    assert_eq!(configuration.sdk_config.ingestion_max_calls, 250);
    assert_eq!(
        configuration.codenames().collect::<Vec<_>>(),
        vec!["color-theme", "new-billing", "legacy-search", "experimental-filter"]
    );
    assert!(configuration.flag("experimental-filter").unwrap().blacklist.is_empty());
}

#[test]
fn evaluates_users() {
    init();
    let configuration = load_configuration();

    let japanese = Entity::new("1").with_attribute("Country", "Japan");
    let result = evaluate(Some(&configuration), "color-theme", Some(&japanese.normalized()));
    assert_eq!(result.reason, Reason::FlagIsSampled);
    assert!(result.is_enabled);
    assert!(result.is_sampled);
    assert_eq!(result.variation.codename, "dark");
    assert_eq!(result.payload.get("contrast"), Some(&AttributeValue::Number(7.0)));
    assert_eq!(result.hashkey.as_deref(), Some("f1a2b3"));

    let signed_up = japanese.clone().with_attribute("signedUpAt", "2020-01-01T00:00:00Z");
    let result = evaluate(Some(&configuration), "color-theme", Some(&signed_up.normalized()));
    assert_eq!(result.reason, Reason::Default);

    let french = Entity::new("2").with_attribute("country", "France");
    let result = evaluate(Some(&configuration), "color-theme", Some(&french.normalized()));
    assert_eq!(result.reason, Reason::Default);
    assert_eq!(result.variation.codename, "off");

    let blacklisted = Entity::new("7").with_attribute("country", "Japan");
    let result = evaluate(Some(&configuration), "color-theme", Some(&blacklisted.normalized()));
    assert_eq!(result.reason, Reason::IndividualBlacklist);

    let whitelisted = Entity::new("99");
    let result = evaluate(Some(&configuration), "color-theme", Some(&whitelisted.normalized()));
    assert_eq!(result.reason, Reason::IndividualWhitelist);
    assert!(result.is_enabled);
    assert!(!result.is_sampled);
    assert_eq!(result.variation.codename, "dark");

    let result = evaluate(Some(&configuration), "legacy-search", Some(&japanese.normalized()));
    assert_eq!(result.reason, Reason::KillSwitchEngaged);
    assert!(!result.is_enabled);

    let result = evaluate(Some(&configuration), "experimental-filter", Some(&japanese.normalized()));
    assert_eq!(result.reason, Reason::Default);

    let result = evaluate(Some(&configuration), "unknown", Some(&japanese.normalized()));
    assert_eq!(result.reason, Reason::FlagNotInConfig);
    assert!(result.new_flag);
}

#[test]
fn evaluates_groups() {
    init();
    let configuration = load_configuration();

    let member = |group: &str| {
        Entity::new("1")
            .with_attribute("seats", 100)
            .with_group(Group::new(group).with_type("Company"))
            .normalized()
    };

    let result = evaluate(Some(&configuration), "new-billing", Some(&member("initech")));
    assert_eq!(result.reason, Reason::GroupWhitelist);
    assert_eq!(result.variation.codename, "on");

    let result = evaluate(Some(&configuration), "new-billing", Some(&member("acme")));
    assert_eq!(result.reason, Reason::GroupBlacklist);

    let result = evaluate(Some(&configuration), "new-billing", Some(&member("globex")));
    assert_eq!(result.reason, Reason::FlagIsSampled);
    assert!(result.payload.is_empty());

    let small = Entity::new("1")
        .with_attribute("seats", 3)
        .with_group(Group::new("globex").with_type("Company"));
    let result = evaluate(Some(&configuration), "new-billing", Some(&small.normalized()));
    assert_eq!(result.reason, Reason::Default);
}

#[tokio::test(start_paused = true)]
async fn reports_usage_through_transport() {
    init();
    let sent = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));

    let flagger = {
        let sent = sent.clone();
        FlaggerConfig::from_api_key("api-key").to_flagger(move |url: String, body: String| {
            let sent = sent.clone();
            async move {
                assert!(url.ends_with("/v3/ingest/api-key"));
                let payload = serde_json::from_str(&body).map_err(Error::transport)?;
                sent.lock().unwrap().push(payload);
                Ok::<(), Error>(())
            }
        })
    };
    flagger.start().unwrap();
    assert!(flagger
        .set_config_json(include_str!("data/config.json"))
        .unwrap());

    flagger.set_entity(Some(Entity::new("1").with_attribute("country", "Korea")));
    assert_eq!(flagger.get_variation("color-theme", None), "dark");

    let mut properties = Attributes::new();
    properties.insert("plan".to_owned(), "pro".into());
    flagger.track("upgrade", properties, None);

    // interval from the configuration
    tokio::time::sleep(Duration::from_secs(31)).await;
    flagger.shutdown().await;

    let sent = sent.lock().unwrap();
    // hello, first exposure, timer flush with the event
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0]["sdkInfo"]["name"], "rust");
    assert_eq!(sent[1]["exposures"][0]["codename"], "color-theme");
    assert_eq!(sent[1]["exposures"][0]["methodCalled"], "getVariation");
    assert_eq!(sent[2]["events"][0]["name"], "upgrade");
    assert_eq!(sent[2]["events"][0]["properties"]["plan"], "pro");
}
