use serde_json::{Value, json};

const BACKEND: &str = "http://localhost:1111";

#[tokio::main]
async fn main() {
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{BACKEND}/vehicles"))
        .json(&json!({ "year": 2025, "plate": "9412AX05" }))
        .send()
        .await
        .unwrap();

    let status = response.status();
    let body = response.text().await.unwrap();
    println!("POST /vehicles -> {status}: {body}");

    let registered: Value = serde_json::from_str(&body).unwrap();
    let code = registered["code"].as_str().unwrap();

    let verification = reqwest::get(format!("{BACKEND}/verify/{code}"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    println!("GET /verify/{code} -> {verification}");
}
