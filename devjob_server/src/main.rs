use std::{error::Error, path::PathBuf, sync::Arc};

use devjob_data::{CreateJob, Device, FileListing, Job, JobList};
use devjob_lib::{
    AdbInventory, DeviceFilter, JobEntry, JobError, JobPool, ShellMaterializer, StreamItem,
};
use rocket::{
    fs::NamedFile,
    http::Status,
    response::stream::{Event, EventStream},
    serde::json::Json,
    Build, Rocket, Shutdown, State,
};
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::Opt,
    error::{reject, ApiResult},
};

#[macro_use]
extern crate rocket;

mod config;
mod error;

const DEFAULT_STREAM_LINES: usize = 40;

#[get("/ping")]
fn ping() -> &'static str {
    "pong"
}

#[get("/?<all>&<reverse>")]
async fn list_jobs(
    pool: &State<JobPool>,
    all: Option<bool>,
    reverse: Option<bool>,
) -> ApiResult<Json<JobList>> {
    pool.list(all.unwrap_or(false), reverse.unwrap_or(false))
        .await
        .map(Json)
        .map_err(reject)
}

#[post("/?<job_id>", format = "json", data = "<request>")]
async fn create_job(
    pool: &State<JobPool>,
    job_id: Option<String>,
    request: Json<CreateJob>,
) -> ApiResult<Json<Job>> {
    let mut request = request.into_inner();
    if job_id.is_some() {
        request.job_id = job_id;
    }
    pool.create(request).await.map(Json).map_err(reject)
}

#[post("/<job_id>", format = "json", data = "<request>")]
async fn create_job_with_id(
    pool: &State<JobPool>,
    job_id: String,
    request: Json<CreateJob>,
) -> ApiResult<Json<Job>> {
    let mut request = request.into_inner();
    request.job_id = Some(job_id);
    pool.create(request).await.map(Json).map_err(reject)
}

#[get("/<job_id>")]
async fn get_job(pool: &State<JobPool>, job_id: &str) -> ApiResult<Json<Job>> {
    pool.info(job_id).await.map(Json).map_err(reject)
}

#[get("/<job_id>/stream?<lines>")]
async fn stream_job(
    pool: &State<JobPool>,
    job_id: &str,
    lines: Option<usize>,
    mut shutdown: Shutdown,
) -> ApiResult<EventStream![]> {
    let mut follower = pool
        .stream(job_id, lines.unwrap_or(DEFAULT_STREAM_LINES))
        .await
        .map_err(reject)?;
    let job_id = job_id.to_string();
    // heartbeats come from the follower, only while the job is alive
    Ok(EventStream! {
        loop {
            let item = tokio::select! {
                item = follower.next() => item,
                _ = &mut shutdown => break,
            };
            match item {
                Ok(Some(StreamItem::Output(text))) => yield Event::data(text).event("output"),
                Ok(Some(StreamItem::Heartbeat)) => yield Event::data("").event("heartbeat"),
                Ok(None) => break,
                Err(err) => {
                    warn!("streaming output of job {} failed: {}", job_id, err);
                    break;
                }
            }
        }
    }
    .heartbeat(None))
}

async fn terminate(pool: &JobPool, job_id: &str) -> ApiResult<Status> {
    pool.terminate(job_id).await.map_err(reject)?;
    Ok(Status::Accepted)
}

#[delete("/<job_id>")]
async fn delete_job(pool: &State<JobPool>, job_id: &str) -> ApiResult<Status> {
    terminate(pool, job_id).await
}

#[get("/<job_id>/stop")]
async fn stop_job(pool: &State<JobPool>, job_id: &str) -> ApiResult<Status> {
    terminate(pool, job_id).await
}

#[derive(Responder)]
enum FileReply {
    Listing(Json<FileListing>),
    File(NamedFile),
}

#[get("/<job_id>/files/<path..>")]
async fn job_files(pool: &State<JobPool>, job_id: &str, path: PathBuf) -> ApiResult<FileReply> {
    match pool.files(job_id, &path).await.map_err(reject)? {
        JobEntry::Dir(files) => Ok(FileReply::Listing(Json(FileListing { files }))),
        JobEntry::File(file) => NamedFile::open(file)
            .await
            .map(FileReply::File)
            .map_err(|err| reject(JobError::Io(err))),
    }
}

async fn remove_files(pool: &JobPool, job_id: &str) -> ApiResult<Status> {
    pool.delete_files(job_id).await.map_err(reject)?;
    Ok(Status::Ok)
}

#[delete("/<job_id>/files")]
async fn delete_job_files(pool: &State<JobPool>, job_id: &str) -> ApiResult<Status> {
    remove_files(pool, job_id).await
}

#[get("/<job_id>/remove_files")]
async fn remove_job_files(pool: &State<JobPool>, job_id: &str) -> ApiResult<Status> {
    remove_files(pool, job_id).await
}

#[get("/?<status>")]
async fn list_devices(pool: &State<JobPool>, status: Option<&str>) -> ApiResult<Json<Vec<Device>>> {
    let filter = match status {
        None => DeviceFilter::All,
        Some(raw) => DeviceFilter::parse(raw).ok_or_else(|| {
            reject(JobError::BadRequest(format!("unknown device status {:?}", raw)))
        })?,
    };
    pool.devices(filter).await.map(Json).map_err(reject)
}

fn build(pool: JobPool) -> Rocket<Build> {
    rocket::build()
        .manage(pool)
        .mount("/api", routes![ping])
        .mount(
            "/api/0/jobs",
            routes![
                list_jobs,
                create_job,
                create_job_with_id,
                get_job,
                stream_job,
                delete_job,
                stop_job,
                job_files,
                delete_job_files,
                remove_job_files,
            ],
        )
        .mount("/api/0/devices", routes![list_devices])
}

#[rocket::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let opt = Opt::from_args();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let pool = JobPool::open(
        opt.pool_config(),
        Arc::new(AdbInventory::new()),
        Arc::new(ShellMaterializer),
    )?;
    info!("jobs live in {}", pool.config().jobs_root.display());
    let report = pool.reconcile().await?;
    info!(
        "reconciled {} crashed and {} orphaned jobs",
        report.recovered.len(),
        report.orphaned.len()
    );

    build(pool)
        .configure(opt.rocket_config())
        .launch()
        .await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use devjob_lib::{JobPool, PoolConfig, ShellMaterializer, StaticInventory};
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
    };
    use serde_json::{json, Value};
    use tempfile::TempDir;

    use super::build;

    async fn client() -> (TempDir, Client) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PoolConfig::new(dir.path());
        config.heartbeat = Duration::from_millis(300);
        config.poll_interval = Duration::from_millis(20);
        let inventory = StaticInventory::healthy(&["X"]).with_device("Y", "offline");
        let pool = JobPool::open(config, Arc::new(inventory), Arc::new(ShellMaterializer)).unwrap();
        let client = Client::tracked(build(pool)).await.unwrap();
        (dir, client)
    }

    async fn create(client: &Client, uri: &str, body: Value) -> (Status, String) {
        let response = client
            .post(uri)
            .header(ContentType::JSON)
            .body(body.to_string())
            .dispatch()
            .await;
        (response.status(), response.into_string().await.unwrap_or_default())
    }

    async fn wait_finished(client: &Client, job_id: &str) -> Value {
        for _ in 0..250 {
            let response = client.get(format!("/api/0/jobs/{}", job_id)).dispatch().await;
            let job: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
            if job.get("exit_code").is_some() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    #[rocket::async_test]
    async fn test_ping() {
        let (_dir, client) = client().await;
        let response = client.get("/api/ping").dispatch().await;
        assert_eq!(Status::Ok, response.status());
        assert_eq!(Some("pong".to_string()), response.into_string().await);
    }

    #[rocket::async_test]
    async fn test_error_statuses() {
        let (_dir, client) = client().await;
        let (status, _) = create(&client, "/api/0/jobs", json!({ "env": {} })).await;
        assert_eq!(Status::BadRequest, status);

        let body = json!({ "repo": { "script": "true" }, "env": { "ANDROID_SERIAL": "Y" } });
        let (status, _) = create(&client, "/api/0/jobs", body).await;
        assert_eq!(Status::NotFound, status);

        let response = client.get("/api/0/jobs/unknown").dispatch().await;
        assert_eq!(Status::NotFound, response.status());
        let response = client.get("/api/0/jobs/unknown/stream").dispatch().await;
        assert_eq!(Status::NotFound, response.status());
        let response = client.delete("/api/0/jobs/unknown").dispatch().await;
        assert_eq!(Status::Gone, response.status());
        let response = client.get("/api/0/jobs/unknown/stop").dispatch().await;
        assert_eq!(Status::Gone, response.status());
        let response = client.delete("/api/0/jobs/unknown/files").dispatch().await;
        assert_eq!(Status::NotFound, response.status());
        let response = client.get("/api/0/devices?status=sideways").dispatch().await;
        assert_eq!(Status::BadRequest, response.status());
    }

    #[rocket::async_test]
    async fn test_job_lifecycle() {
        let (_dir, client) = client().await;
        let body = json!({ "repo": { "script": "echo hello > greeting\necho done\nsleep 0.5" } });
        let (status, created) = create(&client, "/api/0/jobs/first", body.clone()).await;
        assert_eq!(Status::Ok, status);
        let created: Value = serde_json::from_str(&created).unwrap();
        assert_eq!("first", created["job_id"]);
        assert_eq!("no_device", created["env"]["ANDROID_SERIAL"]);

        let (status, _) = create(&client, "/api/0/jobs?job_id=first", body).await;
        assert_eq!(Status::Conflict, status);

        let response = client.get("/api/0/jobs").dispatch().await;
        let listed: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(1, listed["jobs"].as_array().unwrap().len());
        assert!(listed.get("all").is_none());

        let response = client.get("/api/0/jobs/first/remove_files").dispatch().await;
        assert_eq!(Status::Conflict, response.status());

        let job = wait_finished(&client, "first").await;
        assert_eq!(0, job["exit_code"]);

        let response = client.get("/api/0/jobs/first/stream?lines=5").dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let events = response.into_string().await.unwrap();
        assert!(events.contains("output"), "events were {:?}", events);
        assert!(events.contains("done"), "events were {:?}", events);

        let response = client.get("/api/0/jobs/first/files/workspace/greeting").dispatch().await;
        assert_eq!(Status::Ok, response.status());
        assert_eq!(Some("hello\n".to_string()), response.into_string().await);
        let response = client.get("/api/0/jobs/first/files/workspace").dispatch().await;
        let listing: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!("greeting", listing["files"][0]["name"]);

        let response = client.get("/api/0/jobs?all=true").dispatch().await;
        let listed: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert!(listed["jobs"].as_array().unwrap().is_empty());
        assert_eq!(1, listed["all"].as_array().unwrap().len());

        let response = client.delete("/api/0/jobs/first/files").dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let response = client.get("/api/0/jobs/first/remove_files").dispatch().await;
        assert_eq!(Status::NotFound, response.status());
    }

    #[rocket::async_test]
    async fn test_terminate_running_job() {
        let (_dir, client) = client().await;
        let body = json!({ "repo": { "script": "sleep 30" }, "env": { "ANDROID_SERIAL": "X" } });
        let (status, _) = create(&client, "/api/0/jobs/long", body).await;
        assert_eq!(Status::Ok, status);

        let response = client.delete("/api/0/jobs/long").dispatch().await;
        assert_eq!(Status::Accepted, response.status());
        let job = wait_finished(&client, "long").await;
        assert_ne!(0, job["exit_code"]);
    }

    #[rocket::async_test]
    async fn test_devices() {
        let (_dir, client) = client().await;
        let response = client.get("/api/0/devices").dispatch().await;
        let devices: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(2, devices.as_array().unwrap().len());
        let response = client.get("/api/0/devices?status=ok").dispatch().await;
        let devices: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(json!([{ "serial": "X", "state": "device", "healthy": true }]), devices);
    }
}
