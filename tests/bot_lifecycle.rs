use std::time::Duration;
use stream_gambler::{
    health::{
        BotStats,
        HealthServer,
    },
    lifecycle::ConnectError,
    transport::{
        BanEvent,
        ChatEvent,
    },
    test_helpers::{
        TestBot,
        eventually,
        test_config,
    },
};

#[tokio::test(start_paused = true)]
async fn connect__greets_then_asks_for_balance() {
    // given
    let test_bot = TestBot::running(test_config(), &[]);

    // when
    let sent = test_bot.transport.wait_for_sent(2).await;

    // then
    assert_eq!(sent, vec!["!pyk", "!bombs"]);
    assert_eq!(test_bot.transport.joined(), vec!["stream".to_string()]);
    assert!(
        test_bot
            .transport
            .sent()
            .iter()
            .all(|(channel, _)| channel == "stream")
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect__does_not_greet_twice_by_default() {
    // given
    let test_bot = TestBot::running(test_config(), &[]);
    test_bot.transport.wait_for_sent(2).await;

    // when
    test_bot.push(ChatEvent::ReconnectRequested);
    assert!(eventually(|| test_bot.transport.connect_calls() == 2).await);
    tokio::time::sleep(Duration::from_secs(5)).await;

    // then
    assert_eq!(test_bot.transport.sent_texts(), vec!["!pyk", "!bombs"]);
    assert_eq!(test_bot.bot.stats().reconnect_count, 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect__greets_again_when_configured() {
    // given
    let mut config = test_config();
    config.greet_on_reconnect = true;
    let test_bot = TestBot::running(config, &[]);
    test_bot.transport.wait_for_sent(2).await;

    // when
    test_bot.push(ChatEvent::ReconnectRequested);

    // then
    let sent = test_bot.transport.wait_for_sent(4).await;
    assert_eq!(sent, vec!["!pyk", "!bombs", "!pyk", "!bombs"]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_storm__reconnects_once() {
    // given
    let test_bot = TestBot::running(test_config(), &[]);
    test_bot.transport.wait_for_sent(2).await;

    // when
    for _ in 0..8 {
        test_bot.push(ChatEvent::ReconnectRequested);
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    // then
    assert_eq!(test_bot.transport.connect_calls(), 2);
    assert_eq!(test_bot.bot.stats().reconnect_count, 8);
    assert!(test_bot.transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn disconnect__reconnects_without_counting() {
    let test_bot = TestBot::running(test_config(), &[]);
    test_bot.push(ChatEvent::Disconnected {
        reason: "eof".to_string(),
    });
    assert!(eventually(|| test_bot.transport.connect_calls() == 2).await);
    assert_eq!(test_bot.bot.stats().reconnect_count, 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_notice__resends_last_message_without_charging() {
    // given
    let test_bot = TestBot::running(test_config(), &[]);
    test_bot.announce("gambler bombs: 5000");
    test_bot.transport.wait_for_sent(3).await;
    assert_eq!(test_bot.bot.wallet().balance(), 3_000);

    // when
    test_bot.push(ChatEvent::Notice {
        channel: "stream".to_string(),
        message: "You are sending messages too quickly.".to_string(),
    });

    // then
    let sent = test_bot.transport.wait_for_sent(4).await;
    assert_eq!(sent, vec!["!pyk", "!bombs", "!slots", "!slots"]);
    assert_eq!(test_bot.bot.wallet().balance(), 3_000);
}

#[tokio::test(start_paused = true)]
async fn unrelated_notice__is_ignored() {
    let test_bot = TestBot::running(test_config(), &[]);
    test_bot.transport.wait_for_sent(2).await;
    test_bot.push(ChatEvent::Notice {
        channel: "stream".to_string(),
        message: "Now hosting someone.".to_string(),
    });
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(test_bot.transport.sent_texts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn permanent_ban__says_band_message_when_enabled() {
    // given
    let mut config = test_config();
    config.band_on_perma = true;
    let test_bot = TestBot::running(config, &[]);

    // when
    test_bot.push(ChatEvent::Ban(BanEvent {
        channel: "stream".to_string(),
        user_name: "spammer".to_string(),
        duration: None,
    }));
    test_bot.push(ChatEvent::Ban(BanEvent {
        channel: "stream".to_string(),
        user_name: "chatty".to_string(),
        duration: Some(Duration::from_secs(600)),
    }));

    // then
    let sent = test_bot.transport.wait_for_sent(3).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(sent.contains(&"BAND".to_string()));
    assert_eq!(
        test_bot
            .transport
            .sent_texts()
            .iter()
            .filter(|text| *text == "BAND")
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn permanent_ban__is_silent_by_default() {
    let test_bot = TestBot::running(test_config(), &[]);
    test_bot.push(ChatEvent::Ban(BanEvent {
        channel: "stream".to_string(),
        user_name: "spammer".to_string(),
        duration: None,
    }));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(test_bot.transport.sent_texts(), vec!["!pyk", "!bombs"]);
}

#[tokio::test(start_paused = true)]
async fn run__gives_up_after_max_connect_attempts() {
    // given
    let mut config = test_config();
    config.max_connect_attempts = 3;
    let test_bot = TestBot::running(config, &[]);
    test_bot.transport.fail_next_connects(10);

    // when
    tokio::time::sleep(Duration::from_secs(10)).await;
    let transport = test_bot.transport.clone();
    let result = test_bot.shutdown().await;

    // then
    assert_eq!(transport.connect_calls(), 3);
    assert!(matches!(
        result,
        Err(ConnectError::AttemptsExhausted { attempts: 3, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn supervisor_panic__is_not_reported_as_clean_exit() {
    // given
    let test_bot = TestBot::running(test_config(), &[]);
    test_bot.transport.panic_on_connect();

    // when
    tokio::time::sleep(Duration::from_secs(1)).await;
    let joined = test_bot.join().await;

    // then
    assert!(joined.is_err_and(|err| err.is_panic()));
}

#[tokio::test(start_paused = true)]
async fn shutdown__disconnects_cleanly() {
    // given
    let test_bot = TestBot::running(test_config(), &[]);
    test_bot.transport.wait_for_sent(2).await;
    let transport = test_bot.transport.clone();

    // when
    let result = test_bot.shutdown().await;

    // then
    assert_eq!(result, Ok(()));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn health__serves_live_stats() {
    // given
    let test_bot = TestBot::idle(test_config(), &[]);
    test_bot.bot.wallet().set_balance(777);
    let server = HealthServer::bind("127.0.0.1", 0, test_bot.bot.clone()).unwrap();

    // when
    let response = reqwest::get(format!("{}/health", server.base_url()))
        .await
        .unwrap();

    // then
    let stats = response.json::<BotStats>().await.unwrap();
    assert_eq!(stats.status, "ok");
    assert_eq!(stats.bombs, 777);
    assert_eq!(stats.channel, "stream");
    assert_eq!(stats.username, "gambler");
}
