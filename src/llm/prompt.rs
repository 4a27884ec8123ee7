//! Prompt text shared by the providers.

/// Completion-style prompt that ends inside a ```sql fence, so the model's
/// continuation is the query itself.
pub fn completion_prompt(question: &str, context: &str) -> String {
    format!(
        r#"
### Instructions:
Your task is to convert a question into a SQL query for DuckDB, given a table description.
Adhere to these rules:
- **Be careful with column names - they are case sensitive**
- **Use the exact spelling of column names as provided in the description**
- **Deliberately go through the question and table description word by word** to appropriately answer the question
- Only write a single SELECT (or WITH ... SELECT) statement
- When creating a ratio, always cast the numerator as float

### Input:
Generate a SQL query that answers the question `{question}`.
This query will run on a DuckDB database with the following table:

{context}

### Response:
Based on your instructions, here is the SQL query I have generated to answer the question `{question}`:
```sql
"#
    )
}

/// System and user messages for chat-style providers, asking for a JSON
/// answer with `sql` and `explanation`.
pub fn chat_messages(question: &str, context: &str) -> (String, String) {
    let system = format!(
        r#"You are a data analyst assistant that writes DuckDB SQL.

{context}

# Rules
1. Only write a single SELECT (or WITH ... SELECT) statement.
2. Reference column names exactly as described.
3. When creating a ratio, always cast the numerator as float.

# Response Format
Respond with ONLY valid JSON (no markdown):
{{"sql": "<query>", "explanation": "<one sentence>"}}"#
    );
    (system, question.to_string())
}
