use braintrust_eval::{
    scorer, task, Case, Config, Evaluator, ExactMatchScorer, JsonlDataset, LevenshteinScorer, Opts, TaskResult,
    VecDataset,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads BRAINTRUST_API_KEY, BRAINTRUST_DEFAULT_PROJECT and friends.
    let evaluator = Evaluator::<String, String>::connect(Config::from_env()).await?;

    // Example 1: Inline cases
    let cases = vec![
        Case::new("Hello".to_string(), "Hello World!".to_string()),
        Case::new("Hi".to_string(), "Hi World!".to_string()),
    ];

    // Task: append " World!" to any string input
    let greet = task::from_async_fn(|input: String| async move { Ok(format!("{input} World!")) });

    let length = scorer::from_async_fn("length", |result: TaskResult<String, String>| async move {
        Ok(scorer::single(if result.output.len() < 32 { 1.0 } else { 0.0 }))
    });

    let opts = Opts::builder()
        .experiment("simple-greetings")
        .dataset(VecDataset::new(cases))
        .task(greet.clone())
        .scorer(ExactMatchScorer)
        .scorer(LevenshteinScorer::new(0.9))
        .add_scorer(length)
        .parallelism(8)
        .build()?;
    let result = evaluator.run(opts).await?;
    if let Some(errors) = result.error() {
        eprintln!("{} case(s) failed", errors.len());
    }

    // Example 2: Load from JSONL file if provided
    if let Some(path) = std::env::args().nth(1) {
        let opts = Opts::builder()
            .experiment("simple-greetings-file")
            .dataset(JsonlDataset::open(path).await?)
            .task(greet)
            .scorer(ExactMatchScorer)
            .build()?;
        evaluator.run(opts).await?.into_result()?;
    }

    Ok(())
}
