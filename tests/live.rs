//! Smoke tests against real origins; run with `--ignored` when network
//! access is available.

use h2client::{Client, Request};

#[tokio::test]
#[ignore = "requires network access"]
async fn example_com() {
    let client = Client::default();
    let response = client
        .request(Request::get("https://example.com/".try_into().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().contains("Example Domain"));
}

#[tokio::test]
#[ignore = "requires network access"]
async fn google_redirect() {
    let client = Client::default();
    let response = client
        .request(Request::get("https://google.com/".try_into().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), 301);
    assert_eq!(response.header("location"), Some("https://www.google.com/"));
}

#[cfg(feature = "json")]
#[tokio::test]
#[ignore = "requires network access"]
async fn post_json() {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize)]
    struct CreateUser {
        name: String,
        job: String,
    }

    #[derive(Debug, Deserialize)]
    struct CreateUserResponse {
        name: String,
        job: String,
    }

    let client = Client::default();
    let response = client
        .request(
            Request::post_json(
                "https://httpbin.org/anything".try_into().unwrap(),
                &CreateUser {
                    name: "morpheus".to_string(),
                    job: "leader".to_string(),
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    #[derive(Debug, Deserialize)]
    struct Anything {
        json: CreateUserResponse,
    }
    let data: Anything = response.json().unwrap();
    assert_eq!(data.json.name, "morpheus");
    assert_eq!(data.json.job, "leader");
}
